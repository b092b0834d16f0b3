// src/upload.rs
//
// Sequential writer for S3 objects.
//
// Design:
// - Bytes are buffered into parts of `part_size`.  A full part is uploaded
//   right away; writes of a whole part or more skip the buffer.
// - At close, an object of at most `part_size - 1` bytes goes up in a single
//   PutObject when delayed open is allowed.  Otherwise a multipart upload is
//   used, created eagerly at open time when delayed open is off.
// - With background writes, uploads run on the I/O pool.  The shared
//   `UploadState` tracks how many are in flight, the completed parts by slot
//   and the first error seen; flush/close wait for it to go idle.
// - CompleteMultipartUpload responses carrying an embedded error are retried
//   according to the configured `RetryStrategy`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::client::{CompletedPart, ObjectAttributes};
use crate::config::FsOptions;
use crate::constants::{DEFAULT_CONTENT_TYPE, MAX_MULTIPART_PARTS};
use crate::error::{ErrorDetail, FsError, Result};
use crate::io_context::IoContext;
use crate::lifecycle::ClientHolder;
use crate::path::ObjectPath;
use crate::retry::RetryStrategy;

#[derive(Debug, Default)]
struct UploadInner {
    /// Slot `n - 1` holds part `n` once uploaded.
    completed_parts: Vec<Option<CompletedPart>>,
    uploads_in_progress: usize,
    /// First failure among background uploads.
    status: Option<FsError>,
}

/// State shared between a writer and its background uploads.
#[derive(Debug, Default)]
struct UploadState {
    inner: Mutex<UploadInner>,
    idle: Notify,
}

impl UploadState {
    fn lock(&self) -> MutexGuard<'_, UploadInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_upload(&self) {
        self.lock().uploads_in_progress += 1;
    }

    fn add_completed_part(inner: &mut UploadInner, part_number: i32, e_tag: String) {
        let slot = (part_number - 1) as usize;
        if inner.completed_parts.len() <= slot {
            inner.completed_parts.resize(slot + 1, None);
        }
        if inner.completed_parts[slot].is_some() {
            debug!("part {} recorded twice", part_number);
        }
        inner.completed_parts[slot] = Some(CompletedPart { part_number, e_tag });
    }

    /// Record the outcome of one background upload.  `part_number` is `None`
    /// for a single-request upload.
    fn finish_upload(&self, part_number: Option<i32>, outcome: Result<String>) {
        let mut inner = self.lock();
        match (outcome, part_number) {
            (Ok(e_tag), Some(n)) => Self::add_completed_part(&mut inner, n, e_tag),
            (Ok(_), None) => {}
            (Err(e), _) => {
                if inner.status.is_none() {
                    inner.status = Some(e);
                }
            }
        }
        inner.uploads_in_progress = inner.uploads_in_progress.saturating_sub(1);
        let idle = inner.uploads_in_progress == 0;
        drop(inner);
        // Waiters are woken with the lock released.
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no upload is in flight, with the aggregate status.
    async fn wait_idle(&self) -> Result<()> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if inner.uploads_in_progress == 0 {
                    return match &inner.status {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }
}

/// A writable stream to one S3 object.
///
/// Call [`ObjectWriter::close`] to publish the object.  Dropping an unclosed
/// writer aborts any multipart upload in the background.
pub struct ObjectWriter {
    holder: Option<Arc<ClientHolder>>,
    io: IoContext,
    path: ObjectPath,
    attrs: ObjectAttributes,
    retry_strategy: Arc<dyn RetryStrategy>,
    part_size: usize,
    background_writes: bool,
    allow_delayed_open: bool,

    upload_id: Option<String>,
    closed: bool,
    pos: u64,
    part_number: i32,
    current_part: Option<BytesMut>,
    state: Arc<UploadState>,
}

impl std::fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.path.full_path)
            .field("upload_id", &self.upload_id)
            .field("closed", &self.closed)
            .field("pos", &self.pos)
            .field("part_number", &self.part_number)
            .finish()
    }
}

/// Object attributes for a new object: explicit metadata wins over the
/// defaults, and the content type falls back to `application/octet-stream`.
fn resolve_attributes(
    metadata: Option<&BTreeMap<String, String>>,
    defaults: &BTreeMap<String, String>,
) -> ObjectAttributes {
    let chosen = match metadata {
        Some(m) if !m.is_empty() => Some(m),
        _ if !defaults.is_empty() => Some(defaults),
        _ => None,
    };
    let mut attrs = chosen.map(ObjectAttributes::from_metadata).unwrap_or_default();
    if attrs.content_type.is_none() {
        attrs.content_type = Some(DEFAULT_CONTENT_TYPE.to_string());
    }
    attrs
}

impl ObjectWriter {
    /// Open a writer.  Without delayed open, the multipart upload is created here.
    pub async fn open(
        holder: Arc<ClientHolder>,
        io: IoContext,
        path: ObjectPath,
        opts: &FsOptions,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<Self> {
        let mut writer = Self {
            holder: Some(holder),
            io,
            path,
            attrs: resolve_attributes(metadata, &opts.default_metadata),
            retry_strategy: opts.retry_strategy.clone(),
            part_size: opts.part_size,
            background_writes: opts.background_writes,
            allow_delayed_open: opts.allow_delayed_open,
            upload_id: None,
            closed: false,
            pos: 0,
            part_number: 1,
            current_part: None,
            state: Arc::new(UploadState::default()),
        };
        if !writer.allow_delayed_open {
            writer.create_multipart_upload().await?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn is_multipart_created(&self) -> bool {
        self.upload_id.is_some()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::Invalid("Operation on closed stream".into()));
        }
        Ok(())
    }

    pub fn tell(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.pos)
    }

    fn should_be_multipart_upload(&self) -> bool {
        self.pos > (self.part_size as u64 - 1) || !self.allow_delayed_open
    }

    fn holder(&self) -> Result<Arc<ClientHolder>> {
        self.holder.clone().ok_or(FsError::SubsystemFinalized)
    }

    fn provider_error(&self, operation: &str, detail: ErrorDetail) -> FsError {
        FsError::provider(operation, self.path.full_path.clone(), detail)
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.do_write(Bytes::copy_from_slice(data)).await
    }

    /// Write an owned buffer; full parts are sliced out of it without copying.
    pub async fn write_bytes(&mut self, data: Bytes) -> Result<()> {
        self.check_open()?;
        self.do_write(data).await
    }

    async fn do_write(&mut self, mut data: Bytes) -> Result<()> {
        // Top up a partially filled part first.
        if let Some(buf) = self.current_part.as_mut() {
            let to_copy = data.len().min(self.part_size - buf.len());
            buf.extend_from_slice(&data[..to_copy]);
            let _ = data.split_to(to_copy);
            self.pos += to_copy as u64;
            if buf.len() < self.part_size {
                return Ok(());
            }
            self.commit_current_part().await?;
        }

        while data.len() >= self.part_size {
            let part = data.split_to(self.part_size);
            self.pos += part.len() as u64;
            self.upload_part(part).await?;
        }

        if !data.is_empty() {
            let mut buf = BytesMut::with_capacity(self.part_size);
            buf.extend_from_slice(&data);
            self.pos += data.len() as u64;
            self.current_part = Some(buf);
        }
        Ok(())
    }

    /// Wait for background uploads and report their aggregate status.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.state.wait_idle().await
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Upload buffered data, wait for background uploads, then complete the
    /// multipart upload if one was created.  The writer is closed afterwards
    /// whether or not this succeeds.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let res = self.close_inner().await;
        self.cleanup_after_close();
        res
    }

    async fn close_inner(&mut self) -> Result<()> {
        self.ensure_ready_to_flush_from_close().await?;
        self.state.wait_idle().await?;
        if self.upload_id.is_some() {
            self.finish_part_upload_after_flush().await?;
        }
        Ok(())
    }

    fn cleanup_after_close(&mut self) {
        self.current_part = None;
        self.holder = None;
        self.closed = true;
    }

    async fn ensure_ready_to_flush_from_close(&mut self) -> Result<()> {
        if self.should_be_multipart_upload() {
            if self.current_part.is_some() {
                self.commit_current_part().await?;
            }
            // At least one part is mandatory.
            if self.part_number == 1 {
                self.upload_part(Bytes::new()).await?;
            }
        } else {
            self.upload_using_single_request().await?;
        }
        Ok(())
    }

    /// Abort the upload.  A no-op once closed.
    pub async fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // Let in-flight parts land before releasing the session.
        let _ = self.state.wait_idle().await;

        // Local state is released whether or not the remote abort succeeds.
        let res = self.abort_multipart_upload().await;
        if res.is_ok() {
            debug!("aborted upload of {}", self.path);
        }
        self.cleanup_after_close();
        res
    }

    // -------------------------------------------------------------------------
    // Upload helpers
    // -------------------------------------------------------------------------

    async fn abort_multipart_upload(&self) -> Result<()> {
        let Some(upload_id) = &self.upload_id else {
            return Ok(());
        };
        let holder = self.holder()?;
        let (bucket, key) = (&self.path.bucket, &self.path.key);
        let outcome = self
            .io
            .run(async {
                let client = holder.lock().await?;
                Ok::<_, FsError>(client.abort_multipart_upload(bucket, key, upload_id).await)
            })
            .await?;
        outcome.map_err(|d| self.provider_error("aborting multipart upload for", d))
    }

    async fn create_multipart_upload(&mut self) -> Result<()> {
        let holder = self.holder()?;
        let (bucket, key, attrs) = (&self.path.bucket, &self.path.key, &self.attrs);
        let outcome = self
            .io
            .run(async {
                let client = holder.lock().await?;
                Ok::<_, FsError>(client.create_multipart_upload(bucket, key, attrs).await)
            })
            .await?;
        let upload_id = outcome.map_err(|d| self.provider_error("initiating multipart upload for", d))?;
        debug!("created multipart upload {} for {}", upload_id, self.path);
        self.upload_id = Some(upload_id);
        Ok(())
    }

    async fn commit_current_part(&mut self) -> Result<()> {
        if self.upload_id.is_none() {
            self.create_multipart_upload().await?;
        }
        let buf = self.current_part.take().unwrap_or_default();
        self.upload_part(buf.freeze()).await
    }

    async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        if self.upload_id.is_none() {
            self.create_multipart_upload().await?;
        }
        if self.part_number as usize > MAX_MULTIPART_PARTS {
            return Err(FsError::Io(format!(
                "Cannot upload '{}': more than {} parts",
                self.path, MAX_MULTIPART_PARTS
            )));
        }
        let part_number = self.part_number;
        let upload = PartUpload {
            holder: self.holder()?,
            bucket: self.path.bucket.clone(),
            key: self.path.key.clone(),
            full_path: self.path.full_path.clone(),
            upload_id: self.upload_id.clone().unwrap_or_default(),
            part_number,
            body,
        };

        if self.background_writes {
            self.state.begin_upload();
            let io = self.io.clone();
            let state = self.state.clone();
            self.io.handle().spawn(async move {
                let outcome = io.run(upload.send()).await;
                state.finish_upload(Some(part_number), outcome);
            });
        } else {
            let e_tag = self.io.run(upload.send()).await?;
            UploadState::add_completed_part(&mut self.state.lock(), part_number, e_tag);
        }
        self.part_number += 1;
        Ok(())
    }

    async fn upload_using_single_request(&mut self) -> Result<()> {
        let body = self
            .current_part
            .take()
            .map(BytesMut::freeze)
            .unwrap_or_default();
        let put = PutUpload {
            holder: self.holder()?,
            bucket: self.path.bucket.clone(),
            key: self.path.key.clone(),
            full_path: self.path.full_path.clone(),
            attrs: self.attrs.clone(),
            body,
        };

        if self.background_writes {
            self.state.begin_upload();
            let io = self.io.clone();
            let state = self.state.clone();
            self.io.handle().spawn(async move {
                let outcome = io.run(put.send()).await.map(|_| String::new());
                state.finish_upload(None, outcome);
            });
        } else {
            self.io.run(put.send()).await?;
        }
        self.part_number += 1;
        Ok(())
    }

    async fn finish_part_upload_after_flush(&mut self) -> Result<()> {
        let parts: Vec<CompletedPart> = {
            let inner = self.state.lock();
            inner.completed_parts.iter().flatten().cloned().collect()
        };
        let expected = (self.part_number - 1) as usize;
        if parts.len() != expected {
            return Err(FsError::Io(format!(
                "Cannot complete upload of '{}': {} of {} parts uploaded",
                self.path,
                parts.len(),
                expected
            )));
        }
        self.complete_multipart_upload_with_fixup(&parts).await
    }

    /// CompleteMultipartUpload, retrying errors embedded in 200 OK responses.
    async fn complete_multipart_upload_with_fixup(&self, parts: &[CompletedPart]) -> Result<()> {
        let holder = self.holder()?;
        let upload_id = self.upload_id.as_deref().unwrap_or_default();
        let (bucket, key) = (&self.path.bucket, &self.path.key);

        let mut retries = 0u32;
        loop {
            let outcome = self
                .io
                .run(async {
                    let client = holder.lock().await?;
                    Ok::<_, FsError>(client.complete_multipart_upload(bucket, key, upload_id, parts).await)
                })
                .await?
                .map_err(|d| self.provider_error("completing multipart upload for", d))?;

            let Some(detail) = outcome.embedded_error else {
                debug!("completed multipart upload of {} ({} parts)", self.path, parts.len());
                return Ok(());
            };

            let should_retry = self.retry_strategy.should_retry(&detail, retries);
            warn!(
                "CompleteMultipartUpload got error embedded in a 200 OK response: {} (\"{}\"), retry = {}",
                detail.name(),
                detail.message.as_deref().unwrap_or_default(),
                should_retry
            );
            if !should_retry {
                return Err(self.provider_error("completing multipart upload for", detail));
            }
            let delay = self.retry_strategy.delay_before_retry(&detail, retries);
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let (Some(holder), Some(upload_id)) = (self.holder.take(), self.upload_id.take()) else {
            return;
        };
        warn!("writer for {} dropped without close, aborting upload {}", self.path, upload_id);
        // Best effort: we cannot await here.
        let bucket = self.path.bucket.clone();
        let key = self.path.key.clone();
        let state = self.state.clone();
        self.io.handle().spawn(async move {
            let _ = state.wait_idle().await;
            if let Ok(client) = holder.lock().await {
                let _ = client.abort_multipart_upload(&bucket, &key, &upload_id).await;
            }
        });
    }
}

/// One UploadPart call, owned so it can run on the pool.
struct PartUpload {
    holder: Arc<ClientHolder>,
    bucket: String,
    key: String,
    full_path: String,
    upload_id: String,
    part_number: i32,
    body: Bytes,
}

impl PartUpload {
    async fn send(self) -> Result<String> {
        let client = self.holder.lock().await?;
        client
            .upload_part(&self.bucket, &self.key, &self.upload_id, self.part_number, self.body)
            .await
            .map_err(|d| FsError::provider("uploading part for", self.full_path, d))
    }
}

/// One PutObject call, owned so it can run on the pool.
struct PutUpload {
    holder: Arc<ClientHolder>,
    bucket: String,
    key: String,
    full_path: String,
    attrs: ObjectAttributes,
    body: Bytes,
}

impl PutUpload {
    async fn send(self) -> Result<()> {
        let client = self.holder.lock().await?;
        client
            .put_object(&self.bucket, &self.key, self.body, &self.attrs)
            .await
            .map_err(|d| FsError::provider("uploading object", self.full_path, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_idle_reports_first_error() {
        let state = Arc::new(UploadState::default());
        state.begin_upload();
        state.begin_upload();
        let s2 = state.clone();
        let waiter = tokio::spawn(async move { s2.wait_idle().await });

        state.finish_upload(Some(2), Err(FsError::Io("first".into())));
        state.finish_upload(Some(1), Err(FsError::Io("second".into())));
        let res = waiter.await.unwrap();
        assert_eq!(res.unwrap_err().to_string(), "first");
    }

    #[tokio::test]
    async fn parts_fill_slots_by_number() {
        let state = UploadState::default();
        for n in [3, 1, 2] {
            state.begin_upload();
            state.finish_upload(Some(n), Ok(format!("e{}", n)));
        }
        state.wait_idle().await.unwrap();
        let inner = state.lock();
        let numbers: Vec<i32> = inner.completed_parts.iter().flatten().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn attributes_prefer_explicit_metadata() {
        let mut defaults = BTreeMap::new();
        defaults.insert("Content-Type".to_string(), "text/plain".to_string());
        let attrs = resolve_attributes(None, &defaults);
        assert_eq!(attrs.content_type.as_deref(), Some("text/plain"));

        let mut explicit = BTreeMap::new();
        explicit.insert("Cache-Control".to_string(), "no-cache".to_string());
        let attrs = resolve_attributes(Some(&explicit), &defaults);
        assert_eq!(attrs.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(attrs.content_type.as_deref(), Some(DEFAULT_CONTENT_TYPE));
    }
}
