// src/memory.rs
//
// In-process `ObjectClient`.  Used by the test suite and for local runs
// without an endpoint.  Emulates the S3 behaviours the filesystem layer
// depends on (pagination, delimiters, multipart sessions) plus the MinIO
// listing quirk, and supports fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use rand::Rng;

use crate::client::{
    ClientResult, CompleteOutcome, CompletedPart, ListPage, ListRequest, ObjectAttributes,
    ObjectClient, ObjectEntry, ObjectHead,
};
use crate::error::{ErrorDetail, KeyError};
use crate::retry::Backend;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    attrs: ObjectAttributes,
    last_modified: DateTime<Utc>,
    e_tag: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    attrs: ObjectAttributes,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct Faults {
    embedded_complete_errors: usize,
    failing_parts: HashSet<i32>,
    failing_deletes: HashSet<String>,
    put_error: Option<ErrorDetail>,
    part_delay: Option<(Duration, Duration)>,
}

/// An object store held entirely in memory.
#[derive(Debug)]
pub struct MemoryClient {
    flavor: Backend,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
    parts_in_flight: AtomicUsize,
    max_parts_in_flight: AtomicUsize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::with_backend(Backend::Amazon)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryClient {
    /// A store that answers like AWS S3.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that answers like MinIO, including its directory-marker listing quirk.
    pub fn minio() -> Self {
        Self::with_backend(Backend::Minio)
    }

    pub fn with_backend(flavor: Backend) -> Self {
        Self {
            flavor,
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
            parts_in_flight: AtomicUsize::new(0),
            max_parts_in_flight: AtomicUsize::new(0),
        }
    }

    // --- seeding and inspection -------------------------------------------

    pub fn add_bucket(&self, bucket: &str) {
        lock(&self.state).buckets.entry(bucket.to_string()).or_default();
    }

    /// Store an object directly, bypassing call accounting.
    pub fn add_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.add_object_with_type(bucket, key, data, None);
    }

    pub fn add_object_with_type(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
    ) {
        let mut state = lock(&self.state);
        let e_tag = next_etag(&mut state);
        state.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                attrs: ObjectAttributes {
                    content_type: content_type.map(str::to_string),
                    ..Default::default()
                },
                last_modified: Utc::now(),
                e_tag,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }

    pub fn object_attributes(&self, bucket: &str, key: &str) -> Option<ObjectAttributes> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.attrs.clone())
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        lock(&self.state).buckets.contains_key(bucket)
    }

    /// All keys of a bucket, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart sessions created and neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    /// Number of calls made to the named operation, e.g. `"UploadPart"`.
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Highest number of UploadPart calls observed running at once.
    pub fn max_parts_in_flight(&self) -> usize {
        self.max_parts_in_flight.load(Ordering::SeqCst)
    }

    // --- fault injection ----------------------------------------------------

    /// The next `n` CompleteMultipartUpload calls answer 200 OK with an embedded error.
    pub fn inject_embedded_complete_errors(&self, n: usize) {
        lock(&self.faults).embedded_complete_errors = n;
    }

    pub fn fail_upload_part(&self, part_number: i32) {
        lock(&self.faults).failing_parts.insert(part_number);
    }

    pub fn fail_delete_of(&self, key: &str) {
        lock(&self.faults).failing_deletes.insert(key.to_string());
    }

    pub fn fail_puts_with(&self, detail: ErrorDetail) {
        lock(&self.faults).put_error = Some(detail);
    }

    /// Delay each UploadPart by a random duration in `[min, max]`.
    pub fn set_part_delay(&self, min: Duration, max: Duration) {
        lock(&self.faults).part_delay = Some((min, max));
    }

    // --- helpers ------------------------------------------------------------

    fn record(&self, op: &'static str) {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
    }

    fn server(&self) -> &'static str {
        match self.flavor {
            Backend::Amazon => "AmazonS3",
            Backend::Minio => "MinIO",
            Backend::Other => "MemoryStore",
        }
    }

    fn error(&self, code: &str, message: &str, status: u16) -> ErrorDetail {
        ErrorDetail::new(code, message)
            .with_status(status)
            .with_server(self.server())
    }

    fn no_such_bucket(&self, bucket: &str) -> ErrorDetail {
        self.error("NoSuchBucket", &format!("The specified bucket does not exist: {}", bucket), 404)
    }

    fn no_such_key(&self, key: &str) -> ErrorDetail {
        self.error("NoSuchKey", &format!("The specified key does not exist: {}", key), 404)
    }
}

fn next_etag(state: &mut State) -> String {
    state.next_id += 1;
    format!("\"{:032x}\"", state.next_id)
}

enum Listed {
    Object(ObjectEntry),
    Prefix(String),
}

#[async_trait]
impl ObjectClient for MemoryClient {
    async fn head_bucket(&self, bucket: &str) -> ClientResult<()> {
        self.record("HeadBucket");
        if lock(&self.state).buckets.contains_key(bucket) {
            Ok(())
        } else {
            // HEAD responses carry no body, hence no specific code.
            Err(self.error("NotFound", "", 404))
        }
    }

    async fn create_bucket(&self, bucket: &str, _region: Option<&str>) -> ClientResult<()> {
        self.record("CreateBucket");
        let mut state = lock(&self.state);
        if state.buckets.contains_key(bucket) {
            return Err(self.error(
                "BucketAlreadyOwnedByYou",
                "Your previous request to create the named bucket succeeded and you already own it.",
                409,
            ));
        }
        state.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()> {
        self.record("DeleteBucket");
        let mut state = lock(&self.state);
        match state.buckets.get(bucket) {
            None => Err(self.no_such_bucket(bucket)),
            Some(objects) if !objects.is_empty() => Err(self.error(
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
                409,
            )),
            Some(_) => {
                state.buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn list_buckets(&self) -> ClientResult<Vec<String>> {
        self.record("ListBuckets");
        Ok(lock(&self.state).buckets.keys().cloned().collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> ClientResult<ObjectHead> {
        self.record("HeadObject");
        let state = lock(&self.state);
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| self.error("NotFound", "", 404))?;
        let obj = objects
            .get(key)
            .ok_or_else(|| self.error("NotFound", "", 404))?;
        Ok(ObjectHead {
            size: obj.data.len() as u64,
            content_type: obj.attrs.content_type.clone(),
            last_modified: Some(obj.last_modified),
            e_tag: Some(obj.e_tag.clone()),
            version_id: None,
            cache_control: obj.attrs.cache_control.clone(),
            content_language: obj.attrs.content_language.clone(),
            expires: obj.attrs.expires.clone(),
        })
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> ClientResult<Bytes> {
        self.record("GetObject");
        let state = lock(&self.state);
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| self.no_such_bucket(bucket))?;
        let obj = objects.get(key).ok_or_else(|| self.no_such_key(key))?;
        let len = obj.data.len() as u64;
        if offset >= len && !(offset == 0 && len == 0) {
            return Err(self.error("InvalidRange", "The requested range is not satisfiable", 416));
        }
        let end = offset.saturating_add(length).min(len);
        Ok(obj.data.slice(offset as usize..end as usize))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attrs: &ObjectAttributes,
    ) -> ClientResult<()> {
        self.record("PutObject");
        if let Some(err) = lock(&self.faults).put_error.clone() {
            return Err(err);
        }
        let mut state = lock(&self.state);
        let e_tag = next_etag(&mut state);
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| self.no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                attrs: attrs.clone(),
                last_modified: Utc::now(),
                e_tag,
            },
        );
        Ok(())
    }

    async fn copy_object(&self, source: &str, bucket: &str, key: &str) -> ClientResult<()> {
        self.record("CopyObject");
        let source = percent_decode_str(source).decode_utf8_lossy().into_owned();
        let (src_bucket, src_key) = source
            .split_once('/')
            .ok_or_else(|| self.error("InvalidArgument", "Invalid copy source", 400))?;
        let mut state = lock(&self.state);
        let src = state
            .buckets
            .get(src_bucket)
            .ok_or_else(|| self.no_such_bucket(src_bucket))?
            .get(src_key)
            .cloned()
            .ok_or_else(|| self.no_such_key(src_key))?;
        let e_tag = next_etag(&mut state);
        let dest = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| self.no_such_bucket(bucket))?;
        dest.insert(
            key.to_string(),
            StoredObject {
                last_modified: Utc::now(),
                e_tag,
                ..src
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ClientResult<()> {
        self.record("DeleteObject");
        let mut state = lock(&self.state);
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| self.no_such_bucket(bucket))?;
        objects.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> ClientResult<Vec<KeyError>> {
        self.record("DeleteObjects");
        if keys.len() > crate::constants::MULTIPLE_DELETE_MAX_KEYS {
            return Err(self.error("MalformedXML", "Too many keys in DeleteObjects", 400));
        }
        let failing = lock(&self.faults).failing_deletes.clone();
        let mut state = lock(&self.state);
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| self.no_such_bucket(bucket))?;
        let mut errors = Vec::new();
        for key in keys {
            if failing.contains(key) {
                errors.push(KeyError {
                    key: key.clone(),
                    detail: ErrorDetail::new("AccessDenied", "Access Denied"),
                });
            } else {
                objects.remove(key);
            }
        }
        Ok(errors)
    }

    async fn list_objects(&self, req: &ListRequest) -> ClientResult<ListPage> {
        self.record("ListObjectsV2");
        let state = lock(&self.state);
        let objects = state
            .buckets
            .get(&req.bucket)
            .ok_or_else(|| self.no_such_bucket(&req.bucket))?;
        let prefix = req.prefix.as_deref().unwrap_or("");

        let mut entries: Vec<Listed> = Vec::new();
        let mut last_prefix: Option<String> = None;
        for (key, obj) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if self.flavor == Backend::Minio && !prefix.is_empty() && key == prefix {
                continue;
            }
            let rest = &key[prefix.len()..];
            if let Some(delim) = req.delimiter.as_deref().filter(|d| !d.is_empty()) {
                if let Some(idx) = rest.find(delim) {
                    let cp = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    if last_prefix.as_deref() != Some(cp.as_str()) {
                        last_prefix = Some(cp.clone());
                        entries.push(Listed::Prefix(cp));
                    }
                    continue;
                }
            }
            entries.push(Listed::Object(ObjectEntry {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
            }));
        }

        let start = match req.continuation_token.as_deref() {
            Some(tok) => tok
                .parse::<usize>()
                .map_err(|_| self.error("InvalidArgument", "The continuation token provided is incorrect", 400))?,
            None => 0,
        };
        let max_keys = req.max_keys.unwrap_or(1000).max(1) as usize;
        let total = entries.len();
        let end = (start + max_keys).min(total);

        let mut page = ListPage::default();
        for entry in entries.drain(start.min(end)..end) {
            match entry {
                Listed::Object(o) => page.objects.push(o),
                Listed::Prefix(p) => page.common_prefixes.push(p),
            }
        }
        page.key_count = page.objects.len() + page.common_prefixes.len();
        if end < total {
            page.is_truncated = true;
            page.next_continuation_token = Some(end.to_string());
        }
        Ok(page)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attrs: &ObjectAttributes,
    ) -> ClientResult<String> {
        self.record("CreateMultipartUpload");
        let mut state = lock(&self.state);
        if !state.buckets.contains_key(bucket) {
            return Err(self.no_such_bucket(bucket));
        }
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                attrs: attrs.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<String> {
        self.record("UploadPart");
        let now = self.parts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_parts_in_flight.fetch_max(now, Ordering::SeqCst);

        let (delay, fail) = {
            let faults = lock(&self.faults);
            let delay = faults.part_delay.map(|(min, max)| {
                if max > min {
                    rand::rng().random_range(min..=max)
                } else {
                    min
                }
            });
            (delay, faults.failing_parts.contains(&part_number))
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.parts_in_flight.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err(self.error("InternalError", "injected part failure", 500));
        }
        let mut state = lock(&self.state);
        let e_tag = next_etag(&mut state);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| self.error("NoSuchUpload", "The specified upload does not exist", 404))?;
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<CompleteOutcome> {
        self.record("CompleteMultipartUpload");
        {
            let mut faults = lock(&self.faults);
            if faults.embedded_complete_errors > 0 {
                faults.embedded_complete_errors -= 1;
                return Ok(CompleteOutcome {
                    e_tag: None,
                    embedded_error: Some(
                        self.error("InternalError", "We encountered an internal error. Please try again.", 500)
                            .retryable(true),
                    ),
                });
            }
        }

        let mut state = lock(&self.state);
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| self.error("NoSuchUpload", "The specified upload does not exist", 404))?;
        if parts.is_empty() {
            return Err(self.error("MalformedXML", "You must specify at least one part", 400));
        }
        let mut data = BytesMut::new();
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != i as i32 + 1 {
                return Err(self.error("InvalidPartOrder", "The list of parts was not in ascending order", 400));
            }
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.e_tag => data.extend_from_slice(body),
                _ => return Err(self.error("InvalidPart", "One or more of the specified parts could not be found", 400)),
            }
        }
        let Some(upload) = state.uploads.remove(upload_id) else {
            return Err(self.error("NoSuchUpload", "The specified upload does not exist", 404));
        };
        let e_tag = next_etag(&mut state);
        let objects = state
            .buckets
            .get_mut(&upload.bucket)
            .ok_or_else(|| self.no_such_bucket(&upload.bucket))?;
        objects.insert(
            upload.key,
            StoredObject {
                data: data.freeze(),
                attrs: upload.attrs,
                last_modified: Utc::now(),
                e_tag: e_tag.clone(),
            },
        );
        Ok(CompleteOutcome { e_tag: Some(e_tag), embedded_error: None })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> ClientResult<()> {
        self.record("AbortMultipartUpload");
        match lock(&self.state).uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(self.error("NoSuchUpload", "The specified upload does not exist", 404)),
        }
    }
}
