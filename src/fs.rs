// src/fs.rs
//
// Filesystem semantics over an object store: file info, directories emulated
// with markers and prefixes, delete/move/copy, and stream opening.
//
// Every remote call goes through `remote!`, which takes a bounded I/O slot and
// a scoped client lock for that one call only.  Locks are never held across
// two calls, so a pending finalize can always make progress.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::client::{ListRequest, ObjectAttributes, ObjectClient, ObjectHead};
use crate::config::FsOptions;
use crate::constants::{
    BACKEND_PROBE_BUCKET, DEFAULT_REGION, DIRECTORY_CONTENT_TYPE, MULTIPLE_DELETE_MAX_KEYS, SEP,
};
use crate::error::{ErrorDetail, FsError, KeyError, Result};
use crate::io_context::IoContext;
use crate::lifecycle::{ClientHolder, Finalizer};
use crate::listing::{self, FileInfo, FileInfoStream, FileSelector, FileType, ListContext};
use crate::path::{ObjectPath, assert_no_trailing_slash, validate_file_path};
use crate::reader::ObjectReader;
use crate::retry::{Backend, detect_backend, is_already_exists, is_not_found};
use crate::upload::ObjectWriter;

/// Run one client call under an I/O slot and a scoped client lock.
///
/// Evaluates to `Result<ClientResult<T>>`: the outer error is a finalized
/// subsystem or a cancelled context, the inner one is the provider's.
macro_rules! remote {
    ($fs:expr, |$client:ident| $call:expr) => {
        remote!($fs.holder, $fs.io, |$client| $call)
    };
    ($holder:expr, $io:expr, |$client:ident| $call:expr) => {
        $io.run(async {
            let $client = $holder.lock().await?;
            Ok::<_, FsError>($call.await)
        })
        .await
    };
}

/// Whether a HEAD response describes a directory marker.
///
/// Markers never carry data; a zero-length object is one if its key ends with
/// a separator or its content type is the directory sentinel.
pub fn is_directory_marker(key: &str, head: &ObjectHead) -> bool {
    if head.size > 0 {
        return false;
    }
    if key.ends_with(SEP) {
        return true;
    }
    head.content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with(DIRECTORY_CONTENT_TYPE))
}

/// An S3-backed filesystem.
#[derive(Debug)]
pub struct S3FileSystem {
    holder: Arc<ClientHolder>,
    io: IoContext,
    options: FsOptions,
    backend: Mutex<Option<Backend>>,
}

impl S3FileSystem {
    /// Filesystem over `client`, registered with the process-wide finalizer.
    pub async fn new(client: Arc<dyn ObjectClient>, options: FsOptions) -> Result<Self> {
        Self::with_finalizer(client, options, &Finalizer::global()).await
    }

    /// Filesystem registered with a specific finalizer.
    pub async fn with_finalizer(
        client: Arc<dyn ObjectClient>,
        options: FsOptions,
        finalizer: &Arc<Finalizer>,
    ) -> Result<Self> {
        options.validate()?;
        let io = IoContext::new(options.io_concurrency)?;
        let holder = finalizer.add_client(client).await?;
        Ok(Self {
            holder,
            io,
            options,
            backend: Mutex::new(None),
        })
    }

    /// Connect to S3 (or a compatible endpoint) with `options`.
    pub async fn connect(options: FsOptions) -> anyhow::Result<Self> {
        let client = crate::s3_client::S3Client::connect(&options).await?;
        info!(
            "connected to S3 (region {}, endpoint {})",
            options.effective_region(),
            options.endpoint_override.as_deref().unwrap_or("default")
        );
        Ok(Self::new(Arc::new(client), options).await?)
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    pub fn region(&self) -> &str {
        self.options.effective_region()
    }

    pub fn io_context(&self) -> &IoContext {
        &self.io
    }

    /// Stop submitting new remote calls from listings and multi-step operations.
    pub fn cancel(&self) {
        self.io.cancel();
    }

    // -------------------------------------------------------------------------
    // Backend detection
    // -------------------------------------------------------------------------

    /// Remember the backend reported by `detail`.  Sticky once known, unless
    /// it was only detected as `Other`.
    fn get_or_set_backend(&self, detail: &ErrorDetail) -> Backend {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        match *backend {
            Some(b) if b != Backend::Other => b,
            _ => {
                let detected = detect_backend(detail);
                *backend = Some(detected);
                detected
            }
        }
    }

    fn known_backend(&self) -> Option<Backend> {
        *self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The backend, probed with a HEAD on a bucket that cannot exist when unknown.
    pub async fn backend(&self) -> Result<Backend> {
        if let Some(b) = self.known_backend() {
            return Ok(b);
        }
        match remote!(self, |c| c.head_bucket(BACKEND_PROBE_BUCKET))? {
            Err(detail) => Ok(self.get_or_set_backend(&detail)),
            Ok(()) => Ok(Backend::Other),
        }
    }

    // -------------------------------------------------------------------------
    // File info
    // -------------------------------------------------------------------------

    pub async fn get_file_info(&self, s: &str) -> Result<FileInfo> {
        let path = ObjectPath::parse(s)?;

        if path.is_empty() {
            return Ok(FileInfo::directory(s));
        }

        if path.key.is_empty() {
            return match remote!(self, |c| c.head_bucket(&path.bucket))? {
                Ok(()) => Ok(FileInfo::directory(s)),
                Err(detail) => {
                    self.get_or_set_backend(&detail);
                    if is_not_found(&detail) {
                        Ok(FileInfo::not_found(s))
                    } else {
                        Err(FsError::provider("getting information for bucket", &path.bucket, detail))
                    }
                }
            };
        }

        let detail = match remote!(self, |c| c.head_object(&path.bucket, &path.key))? {
            Ok(head) => {
                let mut info = if is_directory_marker(&path.key, &head) {
                    FileInfo::directory(s)
                } else {
                    FileInfo::file(s, head.size, None)
                };
                info.mtime = head.last_modified;
                return Ok(info);
            }
            Err(detail) => detail,
        };
        self.get_or_set_backend(&detail);
        if !is_not_found(&detail) {
            return Err(FsError::provider("getting information for key", &path.full_path, detail));
        }

        // Not an object; maybe an empty or a non-empty directory.
        if self.is_empty_directory(&path, Some(&detail)).await? || self.is_non_empty_directory(&path).await? {
            return Ok(FileInfo::directory(s));
        }
        Ok(FileInfo::not_found(s))
    }

    /// Lazy listing of `selector` as a stream of batches.
    pub fn get_file_info_stream(&self, selector: FileSelector) -> FileInfoStream {
        let ctx = ListContext {
            holder: self.holder.clone(),
            io: self.io.clone(),
            max_keys: self.options.list_max_keys,
        };
        listing::list(ctx, selector)
    }

    /// All entries matching `selector`.
    pub async fn get_file_info_list(&self, selector: FileSelector) -> Result<Vec<FileInfo>> {
        listing::collect(self.get_file_info_stream(selector)).await
    }

    /// File info for several paths, queried concurrently; results keep input order.
    pub async fn get_file_info_many<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<FileInfo>> {
        futures::future::try_join_all(paths.iter().map(|p| self.get_file_info(p.as_ref()))).await
    }

    /// HEAD probe for an empty directory marker.
    ///
    /// With a previous 404 from a plain HEAD, only Minio needs another probe
    /// (it wants the trailing separator).  An unknown backend is detected from
    /// the first failure and the probe retried once with the Minio key.
    async fn is_empty_directory(&self, path: &ObjectPath, previous: Option<&ErrorDetail>) -> Result<bool> {
        if let Some(prev) = previous {
            if self.get_or_set_backend(prev) != Backend::Minio {
                return Ok(false);
            }
        }
        loop {
            let known = self.known_backend();
            let key = if known == Some(Backend::Minio) {
                path.dir_key()
            } else {
                path.key.clone()
            };
            let detail = match remote!(self, |c| c.head_object(&path.bucket, &key))? {
                Ok(_) => return Ok(true),
                Err(detail) => detail,
            };
            if known.is_none() && self.get_or_set_backend(&detail) == Backend::Minio {
                continue;
            }
            if is_not_found(&detail) {
                return Ok(false);
            }
            return Err(FsError::provider("reading information for key", &path.full_path, detail));
        }
    }

    /// A single-key listing under `key/` finds anything.
    async fn is_non_empty_directory(&self, path: &ObjectPath) -> Result<bool> {
        let req = ListRequest {
            bucket: path.bucket.clone(),
            prefix: Some(path.dir_key()),
            delimiter: Some(SEP.to_string()),
            continuation_token: None,
            max_keys: Some(1),
        };
        match remote!(self, |c| c.list_objects(&req))? {
            Ok(page) => Ok(page.key_count > 0 || !page.common_prefixes.is_empty()),
            Err(d) if is_not_found(&d) => Ok(false),
            Err(d) => Err(FsError::provider("listing objects under key", &path.full_path, d)),
        }
    }

    // -------------------------------------------------------------------------
    // Buckets and markers
    // -------------------------------------------------------------------------

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match remote!(self, |c| c.head_bucket(bucket))? {
            Ok(()) => Ok(true),
            Err(d) if is_not_found(&d) => Ok(false),
            Err(d) => Err(FsError::provider("testing for existence of bucket", bucket, d)),
        }
    }

    /// Create `bucket`; succeeds if it already exists.
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match remote!(self, |c| c.head_bucket(bucket))? {
            Ok(()) => return Ok(()),
            Err(d) if !is_not_found(&d) => return Err(FsError::provider("creating bucket", bucket, d)),
            Err(_) => {}
        }
        if !self.options.allow_bucket_creation {
            return Err(FsError::Io(format!(
                "Bucket '{}' not found. To create buckets, enable the allow_bucket_creation option.",
                bucket
            )));
        }

        let region = self.region();
        let constraint = (region != DEFAULT_REGION).then_some(region);
        match remote!(self, |c| c.create_bucket(bucket, constraint))? {
            Ok(()) => {
                info!("created bucket '{}'", bucket);
                Ok(())
            }
            Err(d) if is_already_exists(&d) => Ok(()),
            Err(d) => Err(FsError::provider("creating bucket", bucket, d)),
        }
    }

    /// Put an empty `key/` marker; succeeds if it already exists.
    async fn create_empty_dir(&self, bucket: &str, key: &str) -> Result<()> {
        let key = crate::path::ensure_trailing_slash(key);
        let attrs = ObjectAttributes {
            content_type: Some(DIRECTORY_CONTENT_TYPE.to_string()),
            ..Default::default()
        };
        remote!(self, |c| c.put_object(bucket, &key, Bytes::new(), &attrs))?
            .map_err(|d| FsError::provider("creating key", format!("{}{}{}", bucket, SEP, key), d))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        remote!(self, |c| c.delete_object(bucket, key))?
            .map_err(|d| FsError::provider("deleting key", format!("{}{}{}", bucket, SEP, key), d))
    }

    async fn copy_object(&self, src: &ObjectPath, dest: &ObjectPath) -> Result<()> {
        let source = src.to_url_encoded();
        remote!(self, |c| c.copy_object(&source, &dest.bucket, &dest.key))?.map_err(|d| {
            FsError::provider(format!("copying key to '{}' from", dest), &src.full_path, d)
        })
    }

    async fn ensure_directory_exists(&self, path: &ObjectPath) -> Result<()> {
        if path.key.is_empty() {
            return Ok(());
        }
        self.create_empty_dir(&path.bucket, &path.key).await
    }

    /// Recreate the parent marker, which may have vanished with its last child.
    async fn ensure_parent_exists(&self, path: &ObjectPath) -> Result<()> {
        if !path.has_parent() {
            return Ok(());
        }
        let parent = path.parent()?;
        if !parent.key.is_empty() {
            debug!("recreating parent directory marker {}/", parent);
        }
        self.ensure_directory_exists(&parent).await
    }

    // -------------------------------------------------------------------------
    // Directories
    // -------------------------------------------------------------------------

    /// Create a directory.  With `recursive`, missing ancestors (and the bucket)
    /// are created too; otherwise the parent must exist.
    pub async fn create_dir(&self, s: &str, recursive: bool) -> Result<()> {
        let path = ObjectPath::parse(s)?;
        if path.is_empty() {
            return Err(FsError::InvalidPath("Cannot create the root directory".into()));
        }
        if path.key.is_empty() {
            return self.create_bucket(&path.bucket).await;
        }

        let backend = self.backend().await?;
        let check_existence = self.options.check_directory_existence_before_creation || backend == Backend::Minio;

        if recursive {
            self.create_bucket(&path.bucket).await?;

            let parts = &path.key_parts;
            let mut first_missing = 0;
            if check_existence {
                // Walk up to the deepest existing ancestor.
                for i in (0..parts.len()).rev() {
                    let candidate = format!("{}{}{}", path.bucket, SEP, parts[..=i].join("/"));
                    let info = self.get_file_info(&candidate).await?;
                    if info.exists() {
                        if !info.is_dir() {
                            return Err(FsError::AlreadyExists(info.path));
                        }
                        first_missing = i + 1;
                        break;
                    }
                }
            }
            for i in first_missing..parts.len() {
                self.create_empty_dir(&path.bucket, &parts[..=i].join("/")).await?;
            }
            return Ok(());
        }

        if path.has_parent() {
            let parent = path.parent()?;
            let exists = if parent.key.is_empty() {
                self.bucket_exists(&parent.bucket).await?
            } else {
                self.is_non_empty_directory(&parent).await? || self.is_empty_directory(&parent, None).await?
            };
            if !exists {
                return Err(FsError::Io(format!(
                    "Cannot create directory '{}': parent directory does not exist",
                    path
                )));
            }
        }

        if check_existence {
            let info = self.get_file_info(&path.full_path).await?;
            if info.exists() {
                if !info.is_dir() {
                    return Err(FsError::AlreadyExists(info.path));
                }
                return Ok(());
            }
        }
        self.create_empty_dir(&path.bucket, &path.key).await
    }

    /// Delete a directory and everything under it.  Deleting a bucket requires
    /// `allow_bucket_deletion`; deleting every bucket is not supported.
    pub async fn delete_dir(&self, s: &str) -> Result<()> {
        let path = ObjectPath::parse(s)?;
        if path.is_empty() {
            return Err(FsError::NotImplemented("Cannot delete all S3 buckets".into()));
        }
        self.delete_dir_contents_impl(&path.bucket, &path.key).await?;

        if path.key.is_empty() {
            if !self.options.allow_bucket_deletion {
                return Err(FsError::Io(format!(
                    "Would delete bucket '{}'. To delete buckets, enable the allow_bucket_deletion option.",
                    path.bucket
                )));
            }
            remote!(self, |c| c.delete_bucket(&path.bucket))?
                .map_err(|d| FsError::provider("deleting bucket", &path.bucket, d))?;
            info!("deleted bucket '{}'", path.bucket);
            return Ok(());
        }

        self.delete_object(&path.bucket, &path.dir_key()).await?;
        self.ensure_parent_exists(&path).await
    }

    /// Delete everything under a directory but keep the directory itself.
    pub async fn delete_dir_contents(&self, s: &str, missing_dir_ok: bool) -> Result<()> {
        let path = ObjectPath::parse(s)?;
        if path.is_empty() {
            return Err(FsError::NotImplemented("Cannot delete all S3 buckets".into()));
        }
        match self.delete_dir_contents_impl(&path.bucket, &path.key).await {
            Ok(()) => self.ensure_directory_exists(&path).await,
            Err(e) if missing_dir_ok && e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_root_dir_contents(&self) -> Result<()> {
        Err(FsError::NotImplemented("Cannot delete all S3 buckets".into()))
    }

    /// False if `bucket/key` is a regular file.  A missing key counts as a directory.
    async fn ensure_is_dir(&self, bucket: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(true);
        }
        match remote!(self, |c| c.head_object(bucket, key))? {
            Ok(head) => Ok(is_directory_marker(key, &head)),
            Err(d) if is_not_found(&d) => Ok(true),
            Err(d) => Err(FsError::provider(
                "getting information for key",
                format!("{}{}{}", bucket, SEP, key),
                d,
            )),
        }
    }

    async fn delete_dir_contents_impl(&self, bucket: &str, key: &str) -> Result<()> {
        if !self.ensure_is_dir(bucket, key).await? {
            return Err(FsError::NotADirectory(format!("{}{}{}", bucket, SEP, key)));
        }

        let base = if key.is_empty() { bucket.to_string() } else { format!("{}{}{}", bucket, SEP, key) };
        let mut stream = self.get_file_info_stream(FileSelector::new(base).recursive(true));
        let bucket_prefix = format!("{}{}", bucket, SEP);

        let mut deletes = JoinSet::new();
        let mut first_error = None;
        while let Some(batch) = stream.next().await {
            let batch = match batch.and_then(|b| self.io.check_cancelled().map(|_| b)) {
                Ok(b) => b,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };
            let keys: Vec<String> = batch
                .iter()
                .filter_map(|info| {
                    let k = info.path.strip_prefix(&bucket_prefix)?;
                    Some(if info.is_dir() { format!("{}{}", k, SEP) } else { k.to_string() })
                })
                .collect();
            for chunk in keys.chunks(MULTIPLE_DELETE_MAX_KEYS) {
                let (holder, io) = (self.holder.clone(), self.io.clone());
                let (bucket, chunk) = (bucket.to_string(), chunk.to_vec());
                deletes.spawn_on(
                    async move {
                        remote!(holder, io, |c| c.delete_objects(&bucket, &chunk))?
                            .map_err(|d| FsError::provider("deleting objects in bucket", bucket, d))
                    },
                    self.io.handle(),
                );
            }
        }

        // Every submitted batch finishes before reporting.
        let mut failures: Vec<KeyError> = Vec::new();
        while let Some(joined) = deletes.join_next().await {
            match joined {
                Ok(Ok(failed)) => failures.extend(failed),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(FsError::Io(format!("delete task failed: {}", e)));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !failures.is_empty() {
            return Err(FsError::PartialBatchFailure {
                bucket: bucket.to_string(),
                failures,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    /// Delete a regular file.  Directories are rejected with `NotAFile`.
    pub async fn delete_file(&self, s: &str) -> Result<()> {
        let path = ObjectPath::parse(s)?;
        validate_file_path(&path)?;

        match remote!(self, |c| c.head_object(&path.bucket, &path.key))? {
            Ok(head) if is_directory_marker(&path.key, &head) => {
                return Err(FsError::NotAFile(path.full_path.clone()));
            }
            Ok(_) => {}
            Err(d) if is_not_found(&d) => {
                if self.is_empty_directory(&path, Some(&d)).await? || self.is_non_empty_directory(&path).await? {
                    return Err(FsError::NotAFile(path.full_path.clone()));
                }
                return Err(FsError::NotFound(path.full_path.clone()));
            }
            Err(d) => return Err(FsError::provider("getting information for key", &path.full_path, d)),
        }

        self.delete_object(&path.bucket, &path.key).await?;
        self.ensure_parent_exists(&path).await
    }

    /// Move a file by copy then delete.  Same-path moves do nothing.
    pub async fn move_file(&self, src: &str, dest: &str) -> Result<()> {
        let src_path = ObjectPath::parse(src)?;
        validate_file_path(&src_path)?;
        let dest_path = ObjectPath::parse(dest)?;
        validate_file_path(&dest_path)?;

        if src_path == dest_path {
            return Ok(());
        }

        match remote!(self, |c| c.head_object(&src_path.bucket, &src_path.key))? {
            Ok(head) if is_directory_marker(&src_path.key, &head) => {
                return Err(FsError::NotImplemented("moving directories is not supported".into()));
            }
            Ok(_) => {}
            Err(d) if is_not_found(&d) => {
                if self.is_empty_directory(&src_path, Some(&d)).await?
                    || self.is_non_empty_directory(&src_path).await?
                {
                    return Err(FsError::NotImplemented("moving directories is not supported".into()));
                }
                return Err(FsError::NotFound(src_path.full_path.clone()));
            }
            Err(d) => return Err(FsError::provider("getting information for key", &src_path.full_path, d)),
        }

        self.io.check_cancelled()?;
        self.copy_object(&src_path, &dest_path).await?;
        self.io.check_cancelled()?;
        self.delete_object(&src_path.bucket, &src_path.key).await?;
        self.ensure_parent_exists(&src_path).await
    }

    /// Server-side copy of a file.  Same-path copies do nothing.
    pub async fn copy_file(&self, src: &str, dest: &str) -> Result<()> {
        let src_path = ObjectPath::parse(src)?;
        validate_file_path(&src_path)?;
        let dest_path = ObjectPath::parse(dest)?;
        validate_file_path(&dest_path)?;

        if src_path == dest_path {
            return Ok(());
        }
        self.copy_object(&src_path, &dest_path).await
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    pub async fn open_input_file(&self, s: &str) -> Result<ObjectReader> {
        assert_no_trailing_slash(s)?;
        let path = ObjectPath::parse(s)?;
        validate_file_path(&path)?;
        ObjectReader::open(self.holder.clone(), self.io.clone(), path).await
    }

    /// Open from a known `FileInfo`; skips the HEAD when the size is known.
    pub async fn open_input_file_with_info(&self, info: &FileInfo) -> Result<ObjectReader> {
        match info.file_type {
            FileType::NotFound => return Err(FsError::NotFound(info.path.clone())),
            FileType::File | FileType::Unknown => {}
            FileType::Directory => return Err(FsError::NotAFile(info.path.clone())),
        }
        assert_no_trailing_slash(&info.path)?;
        let path = ObjectPath::parse(&info.path)?;
        validate_file_path(&path)?;
        match info.size {
            Some(size) => Ok(ObjectReader::with_size(self.holder.clone(), self.io.clone(), path, size)),
            None => ObjectReader::open(self.holder.clone(), self.io.clone(), path).await,
        }
    }

    /// Open a writer.  `metadata` overrides the configured default metadata.
    pub async fn open_output_stream(
        &self,
        s: &str,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<ObjectWriter> {
        assert_no_trailing_slash(s)?;
        let path = ObjectPath::parse(s)?;
        validate_file_path(&path)?;
        ObjectWriter::open(self.holder.clone(), self.io.clone(), path, &self.options, metadata).await
    }

    pub async fn open_append_stream(&self, _s: &str) -> Result<ObjectWriter> {
        Err(FsError::NotImplemented(
            "It is not possible to append efficiently to S3 objects".into(),
        ))
    }
}
