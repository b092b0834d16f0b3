// tests/listing.rs
//
// Directory listings through `get_file_info_stream` / `get_file_info_list`.

mod common;

use common::{options, setup_with};
use s3fs::{FileInfo, FileSelector, FileType, FsError, MemoryClient};
use tokio_stream::StreamExt;

fn tree() -> MemoryClient {
    let client = MemoryClient::new();
    client.add_object("bucket", "data/a.txt", "abc");
    client.add_object("bucket", "data/empty/", "");
    client.add_object("bucket", "data/sub/b.txt", "bb");
    client.add_object("bucket", "data/sub/deep/c.txt", "c");
    client.add_object("bucket", "other.txt", "o");
    client
}

fn sorted(mut infos: Vec<FileInfo>) -> Vec<(String, FileType)> {
    infos.sort_by(|a, b| a.path.cmp(&b.path));
    infos.into_iter().map(|i| (i.path, i.file_type)).collect()
}

fn entries(list: &[(&str, FileType)]) -> Vec<(String, FileType)> {
    list.iter().map(|(p, t)| (p.to_string(), *t)).collect()
}

use FileType::{Directory as D, File as F};

#[tokio::test]
async fn direct_children_only() {
    let t = setup_with(tree(), options()).await;
    let infos = t.fs.get_file_info_list(FileSelector::new("bucket/data")).await.unwrap();
    assert_eq!(
        sorted(infos),
        entries(&[("bucket/data/a.txt", F), ("bucket/data/empty", D), ("bucket/data/sub", D)])
    );
}

#[tokio::test]
async fn recursive_listing_reports_each_directory_once() {
    let t = setup_with(tree(), options()).await;
    let infos = t
        .fs
        .get_file_info_list(FileSelector::new("bucket/data").recursive(true))
        .await
        .unwrap();
    let file = infos.iter().find(|i| i.path == "bucket/data/a.txt").unwrap();
    assert_eq!(file.size, Some(3));
    assert!(file.mtime.is_some());
    assert_eq!(
        sorted(infos),
        entries(&[
            ("bucket/data/a.txt", F),
            ("bucket/data/empty", D),
            ("bucket/data/sub", D),
            ("bucket/data/sub/b.txt", F),
            ("bucket/data/sub/deep", D),
            ("bucket/data/sub/deep/c.txt", F),
        ])
    );
}

#[tokio::test]
async fn max_recursion_limits_depth() {
    let t = setup_with(tree(), options()).await;

    let one = FileSelector::new("bucket/data").recursive(true).max_recursion(1);
    assert_eq!(
        sorted(t.fs.get_file_info_list(one).await.unwrap()),
        entries(&[
            ("bucket/data/a.txt", F),
            ("bucket/data/empty", D),
            ("bucket/data/sub", D),
            ("bucket/data/sub/b.txt", F),
            ("bucket/data/sub/deep", D),
        ])
    );

    let zero = FileSelector::new("bucket/data").recursive(true).max_recursion(0);
    assert_eq!(
        sorted(t.fs.get_file_info_list(zero).await.unwrap()),
        entries(&[("bucket/data/a.txt", F), ("bucket/data/empty", D), ("bucket/data/sub", D)])
    );
}

#[tokio::test]
async fn pagination_is_transparent() {
    let mut opts = options();
    opts.list_max_keys = 2;
    let t = setup_with(tree(), opts).await;

    let mut stream = t.fs.get_file_info_stream(FileSelector::new("bucket/data").recursive(true));
    let mut batches = 0;
    let mut all = Vec::new();
    while let Some(batch) = stream.next().await {
        batches += 1;
        all.extend(batch.unwrap());
    }
    assert_eq!(batches, 2);
    assert_eq!(t.client.calls("ListObjectsV2"), 2);
    assert_eq!(all.len(), 6);
}

#[tokio::test]
async fn missing_directory() {
    let t = setup_with(tree(), options()).await;

    let err = t.fs.get_file_info_list(FileSelector::new("bucket/nope")).await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(ref p) if p == "bucket/nope"), "{err}");

    let infos = t
        .fs
        .get_file_info_list(FileSelector::new("bucket/nope").allow_not_found(true))
        .await
        .unwrap();
    assert!(infos.is_empty());

    let infos = t
        .fs
        .get_file_info_list(FileSelector::new("nobucket").recursive(true).allow_not_found(true))
        .await
        .unwrap();
    assert!(infos.is_empty());
    assert!(t.fs.get_file_info_list(FileSelector::new("nobucket")).await.is_err());
}

#[tokio::test]
async fn empty_directory_marker_lists_as_empty() {
    let t = setup_with(tree(), options()).await;
    let infos = t.fs.get_file_info_list(FileSelector::new("bucket/data/empty")).await.unwrap();
    assert!(infos.is_empty());
}

#[tokio::test]
async fn whole_store_listing() {
    let client = MemoryClient::new();
    client.add_object("alpha", "x/y", "1");
    client.add_bucket("beta");
    let t = setup_with(client, options()).await;

    let top = t.fs.get_file_info_list(FileSelector::new("")).await.unwrap();
    assert_eq!(sorted(top), entries(&[("alpha", D), ("beta", D)]));

    let shallow = FileSelector::new("").recursive(true).max_recursion(0);
    assert_eq!(t.fs.get_file_info_list(shallow).await.unwrap().len(), 2);

    let all = t.fs.get_file_info_list(FileSelector::new("").recursive(true)).await.unwrap();
    assert_eq!(
        sorted(all),
        entries(&[("alpha", D), ("alpha/x", D), ("alpha/x/y", F), ("beta", D)])
    );
}

#[tokio::test]
async fn cancelled_listing_fails() {
    let t = setup_with(tree(), options()).await;
    t.fs.cancel();
    let err = t.fs.get_file_info_list(FileSelector::new("bucket/data")).await.unwrap_err();
    assert!(matches!(err, FsError::Cancelled), "{err}");
    assert!(matches!(t.fs.get_file_info("bucket/data").await, Err(FsError::Cancelled)));
}

#[tokio::test]
async fn dropping_the_stream_early_is_harmless() {
    let mut opts = options();
    opts.list_max_keys = 1;
    let t = setup_with(tree(), opts).await;

    let mut stream = t.fs.get_file_info_stream(FileSelector::new("bucket").recursive(true));
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(stream);

    // The filesystem keeps working.
    assert!(t.fs.get_file_info("bucket/other.txt").await.unwrap().is_file());
}
