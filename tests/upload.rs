// tests/upload.rs
//
// Output streams: single-request vs multipart decisions, part ordering,
// embedded CompleteMultipartUpload errors, abort and failure surfacing.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{PART_SIZE, options, payload, setup, setup_with};
use s3fs::{AwsDefaultRetryStrategy, ErrorDetail, FsError, MemoryClient};

fn bucket_client() -> MemoryClient {
    let client = MemoryClient::new();
    client.add_bucket("bucket");
    client
}

#[tokio::test]
async fn small_delayed_write_uses_one_put() {
    let t = setup_with(bucket_client(), options().with_delayed_open(true)).await;
    let data = payload(PART_SIZE - 1);

    let mut w = t.fs.open_output_stream("bucket/small", None).await.unwrap();
    assert!(!w.is_multipart_created());
    w.write(&data).await.unwrap();
    w.close().await.unwrap();

    assert_eq!(t.client.calls("PutObject"), 1);
    assert_eq!(t.client.calls("CreateMultipartUpload"), 0);
    assert_eq!(t.client.object("bucket", "small").unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn write_past_one_part_goes_multipart() {
    let t = setup_with(bucket_client(), options().with_delayed_open(true)).await;
    let data = payload(PART_SIZE + 1);

    let mut w = t.fs.open_output_stream("bucket/big", None).await.unwrap();
    w.write(&data).await.unwrap();
    assert!(w.is_multipart_created());
    assert_eq!(w.tell().unwrap(), (PART_SIZE + 1) as u64);
    w.close().await.unwrap();

    assert_eq!(t.client.calls("PutObject"), 0);
    assert_eq!(t.client.calls("CreateMultipartUpload"), 1);
    assert_eq!(t.client.calls("UploadPart"), 2);
    assert_eq!(t.client.calls("CompleteMultipartUpload"), 1);
    assert_eq!(t.client.object("bucket", "big").unwrap().as_ref(), &data[..]);
    assert_eq!(t.client.pending_uploads(), 0);
}

#[tokio::test]
async fn eager_open_creates_upload_and_empty_part() {
    let t = setup().await;

    let mut w = t.fs.open_output_stream("bucket/empty", None).await.unwrap();
    assert!(w.is_multipart_created());
    assert_eq!(t.client.calls("CreateMultipartUpload"), 1);
    w.close().await.unwrap();

    assert_eq!(t.client.calls("UploadPart"), 1);
    assert_eq!(t.client.object("bucket", "empty").map(|b| b.len()), Some(0));
}

#[tokio::test]
async fn delayed_empty_object_is_a_single_put() {
    let t = setup_with(bucket_client(), options().with_delayed_open(true)).await;
    let mut w = t.fs.open_output_stream("bucket/empty", None).await.unwrap();
    w.close().await.unwrap();

    assert_eq!(t.client.calls("PutObject"), 1);
    assert_eq!(t.client.object("bucket", "empty").map(|b| b.len()), Some(0));
}

#[tokio::test]
async fn parts_complete_in_order_under_random_delays() {
    let t = setup().await;
    t.client.set_part_delay(Duration::from_millis(1), Duration::from_millis(15));
    let data = payload(PART_SIZE * 20 + 5);

    let mut w = t.fs.open_output_stream("bucket/many", None).await.unwrap();
    for chunk in data.chunks(7) {
        w.write(chunk).await.unwrap();
    }
    w.close().await.unwrap();

    assert_eq!(t.client.calls("UploadPart"), 21);
    assert_eq!(t.client.object("bucket", "many").unwrap().as_ref(), &data[..]);
    let peak = t.client.max_parts_in_flight();
    assert!(peak > 1 && peak <= 8, "parts in flight peaked at {peak}");
}

#[tokio::test]
async fn foreground_writes_upload_inline() {
    let t = setup_with(bucket_client(), options().with_background_writes(false)).await;
    let data = payload(PART_SIZE * 3 + 2);

    let mut w = t.fs.open_output_stream("bucket/fg", None).await.unwrap();
    w.write_bytes(data.clone().into()).await.unwrap();
    // Three full parts already went up.
    assert_eq!(t.client.calls("UploadPart"), 3);
    w.close().await.unwrap();

    assert_eq!(t.client.calls("UploadPart"), 4);
    assert_eq!(t.client.object("bucket", "fg").unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn embedded_complete_errors_are_retried() {
    let t = setup().await;
    t.client.inject_embedded_complete_errors(2);
    let data = payload(PART_SIZE * 2);

    let mut w = t.fs.open_output_stream("bucket/retry", None).await.unwrap();
    w.write(&data).await.unwrap();
    w.close().await.unwrap();

    assert_eq!(t.client.calls("CompleteMultipartUpload"), 3);
    assert_eq!(t.client.object("bucket", "retry").unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn embedded_complete_error_fails_once_retries_run_out() {
    let opts = options().with_retry_strategy(Arc::new(AwsDefaultRetryStrategy::new(1)));
    let t = setup_with(bucket_client(), opts).await;
    t.client.inject_embedded_complete_errors(5);

    let mut w = t.fs.open_output_stream("bucket/retry", None).await.unwrap();
    w.write(&payload(PART_SIZE)).await.unwrap();
    let err = w.close().await.unwrap_err();

    assert!(matches!(err, FsError::Provider { .. }), "{err}");
    assert!(err.to_string().contains("completing multipart upload"), "{err}");
    assert_eq!(t.client.calls("CompleteMultipartUpload"), 2);
    assert!(t.client.object("bucket", "retry").is_none());
    assert!(w.closed());
}

#[tokio::test]
async fn failed_part_surfaces_at_close() {
    let t = setup().await;
    t.client.fail_upload_part(2);

    let mut w = t.fs.open_output_stream("bucket/broken", None).await.unwrap();
    // Background writes do not fail the write call itself.
    w.write(&payload(PART_SIZE * 3)).await.unwrap();
    let err = w.close().await.unwrap_err();

    assert!(err.to_string().contains("uploading part for"), "{err}");
    assert_eq!(t.client.calls("CompleteMultipartUpload"), 0);
    assert!(t.client.object("bucket", "broken").is_none());
}

#[tokio::test]
async fn failed_put_surfaces_at_close() {
    let t = setup_with(bucket_client(), options().with_delayed_open(true)).await;
    t.client.fail_puts_with(ErrorDetail::new("AccessDenied", "Access Denied").with_status(403));

    let mut w = t.fs.open_output_stream("bucket/denied", None).await.unwrap();
    w.write(b"abc").await.unwrap();
    let err = w.close().await.unwrap_err();
    assert_eq!(err.detail().and_then(|d| d.code.as_deref()), Some("AccessDenied"));
}

#[tokio::test]
async fn abort_discards_the_upload() {
    let t = setup().await;
    let mut w = t.fs.open_output_stream("bucket/aborted", None).await.unwrap();
    w.write(&payload(PART_SIZE * 2 + 3)).await.unwrap();
    w.abort().await.unwrap();

    assert_eq!(t.client.calls("AbortMultipartUpload"), 1);
    assert_eq!(t.client.pending_uploads(), 0);
    assert!(t.client.object("bucket", "aborted").is_none());

    assert!(matches!(w.write(b"x").await, Err(FsError::Invalid(_))));
    // Both are no-ops once closed.
    w.close().await.unwrap();
    w.abort().await.unwrap();
    assert_eq!(t.client.calls("AbortMultipartUpload"), 1);
}

#[tokio::test]
async fn failed_abort_still_closes_the_writer() {
    let t = setup().await;
    let mut w = t.fs.open_output_stream("bucket/late", None).await.unwrap();
    w.write(b"abc").await.unwrap();

    t.finalizer.finalize().await;
    assert!(matches!(w.abort().await, Err(FsError::SubsystemFinalized)));
    assert!(w.closed());
    w.abort().await.unwrap();
    drop(w);
    assert_eq!(t.client.calls("AbortMultipartUpload"), 0);
}

#[tokio::test]
async fn closed_writer_rejects_operations() {
    let t = setup().await;
    let mut w = t.fs.open_output_stream("bucket/k", None).await.unwrap();
    w.write(b"abc").await.unwrap();
    w.close().await.unwrap();
    w.close().await.unwrap();

    assert!(matches!(w.write(b"x").await, Err(FsError::Invalid(_))));
    assert!(matches!(w.tell(), Err(FsError::Invalid(_))));
    assert!(matches!(w.flush().await, Err(FsError::Invalid(_))));
    assert_eq!(t.client.object("bucket", "k").unwrap().as_ref(), b"abc");
}

#[tokio::test]
async fn dropped_writer_aborts_in_background() {
    let t = setup().await;
    {
        let mut w = t.fs.open_output_stream("bucket/dropped", None).await.unwrap();
        w.write(&payload(PART_SIZE)).await.unwrap();
    }
    for _ in 0..100 {
        if t.client.pending_uploads() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(t.client.pending_uploads(), 0);
    assert!(t.client.object("bucket", "dropped").is_none());
}

#[tokio::test]
async fn flush_waits_for_background_parts() {
    let t = setup().await;
    t.client.set_part_delay(Duration::from_millis(5), Duration::from_millis(5));

    let mut w = t.fs.open_output_stream("bucket/f", None).await.unwrap();
    w.write(&payload(PART_SIZE * 4)).await.unwrap();
    w.flush().await.unwrap();
    assert_eq!(t.client.calls("UploadPart"), 4);
    assert!(t.client.object("bucket", "f").is_none());
    w.close().await.unwrap();
    assert!(t.client.object("bucket", "f").is_some());
}

#[tokio::test]
async fn metadata_and_defaults() {
    let mut defaults = BTreeMap::new();
    defaults.insert("Content-Type".to_string(), "text/csv".to_string());
    let t = setup_with(bucket_client(), options().with_default_metadata(defaults)).await;

    let mut w = t.fs.open_output_stream("bucket/default.csv", None).await.unwrap();
    w.write(b"a,b").await.unwrap();
    w.close().await.unwrap();
    let attrs = t.client.object_attributes("bucket", "default.csv").unwrap();
    assert_eq!(attrs.content_type.as_deref(), Some("text/csv"));

    let mut explicit = BTreeMap::new();
    explicit.insert("Content-Type".to_string(), "application/json".to_string());
    explicit.insert("Cache-Control".to_string(), "no-cache".to_string());
    let mut w = t.fs.open_output_stream("bucket/x.json", Some(&explicit)).await.unwrap();
    w.write(b"{}").await.unwrap();
    w.close().await.unwrap();
    let attrs = t.client.object_attributes("bucket", "x.json").unwrap();
    assert_eq!(attrs.content_type.as_deref(), Some("application/json"));
    assert_eq!(attrs.cache_control.as_deref(), Some("no-cache"));

    let r = t.fs.open_input_file("bucket/x.json").await.unwrap();
    assert_eq!(r.metadata().get("Content-Type").map(String::as_str), Some("application/json"));
}

#[tokio::test]
async fn missing_bucket_fails_at_open() {
    let t = setup().await;
    let err = t.fs.open_output_stream("nobucket/k", None).await.unwrap_err();
    assert!(err.to_string().contains("initiating multipart upload"), "{err}");
}
