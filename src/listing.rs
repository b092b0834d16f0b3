// src/listing.rs
//
// Directory listing over ListObjectsV2.
//
// A lister walks one bucket/prefix page by page, turning keys into `FileInfo`
// entries: regular files, directory markers, and implicit directories
// inferred from deeper keys.  Batches are pushed through a bounded channel
// that closes once every producer is done, after the last page or after the
// first error.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::client::{ListPage, ListRequest};
use crate::constants::{LISTING_CHANNEL_CAPACITY, SEP};
use crate::error::{FsError, Result};
use crate::io_context::IoContext;
use crate::lifecycle::ClientHolder;
use crate::path::{ObjectPath, path_depth, remove_trailing_slash, slice_path, split_parent};
use crate::retry::is_not_found;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    NotFound,
    Unknown,
    File,
    Directory,
}

/// Type, size and modification time of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, file_type: FileType) -> Self {
        Self { path: path.into(), file_type, size: None, mtime: None }
    }

    pub fn file(path: impl Into<String>, size: u64, mtime: Option<DateTime<Utc>>) -> Self {
        Self { path: path.into(), file_type: FileType::File, size: Some(size), mtime }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self::new(path, FileType::Directory)
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::new(path, FileType::NotFound)
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn exists(&self) -> bool {
        self.file_type != FileType::NotFound
    }

    /// Last path component.
    pub fn base_name(&self) -> &str {
        split_parent(&self.path).1
    }
}

/// What to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    pub base_dir: String,
    pub recursive: bool,
    /// Deepest level below `base_dir` to report; 0 means direct children only.
    pub max_recursion: u32,
    /// Yield nothing instead of `NotFound` when `base_dir` does not exist.
    pub allow_not_found: bool,
}

impl FileSelector {
    pub fn new(base_dir: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            recursive: false,
            max_recursion: u32::MAX,
            allow_not_found: false,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn max_recursion(mut self, max_recursion: u32) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    pub fn allow_not_found(mut self, allow: bool) -> Self {
        self.allow_not_found = allow;
        self
    }
}

/// Lazy, finite sequence of listing batches.
pub type FileInfoStream = ReceiverStream<Result<Vec<FileInfo>>>;

type BatchSender = mpsc::Sender<Result<Vec<FileInfo>>>;

/// Everything a lister needs besides its selector.
#[derive(Debug, Clone)]
pub(crate) struct ListContext {
    pub holder: Arc<ClientHolder>,
    pub io: IoContext,
    pub max_keys: i32,
}

/// Start listing `selector` in the background and return the stream of batches.
pub(crate) fn list(ctx: ListContext, selector: FileSelector) -> FileInfoStream {
    let (tx, rx) = mpsc::channel(LISTING_CHANNEL_CAPACITY);
    let handle = ctx.io.handle().clone();
    handle.spawn(async move {
        let res = match ObjectPath::parse(&selector.base_dir) {
            Ok(base) if base.is_empty() => list_store(ctx, &selector, &tx).await,
            Ok(base) => {
                PrefixLister::new(ctx, &base.bucket, &base.key, &selector, tx.clone())
                    .run()
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            debug!("listing of '{}' failed: {}", selector.base_dir, e);
            let _ = tx.send(Err(e)).await;
        }
    });
    ReceiverStream::new(rx)
}

/// Drain a listing stream, stopping at the first error.
pub async fn collect(mut stream: FileInfoStream) -> Result<Vec<FileInfo>> {
    let mut out = Vec::new();
    while let Some(batch) = stream.next().await {
        out.extend(batch?);
    }
    Ok(out)
}

/// List the buckets as directories, then each bucket concurrently when recursing.
async fn list_store(ctx: ListContext, selector: &FileSelector, tx: &BatchSender) -> Result<()> {
    let buckets = ctx
        .io
        .run(async {
            let client = ctx.holder.lock().await?;
            Ok::<_, FsError>(client.list_buckets().await)
        })
        .await?
        .map_err(|d| FsError::provider("listing", "buckets", d))?;

    let dirs = buckets.iter().map(FileInfo::directory).collect();
    if tx.send(Ok(dirs)).await.is_err() {
        return Ok(());
    }
    if !(selector.recursive && selector.max_recursion > 0) {
        return Ok(());
    }

    let handle = ctx.io.handle().clone();
    let mut tasks = JoinSet::new();
    for bucket in buckets {
        let sub = FileSelector::new(bucket.clone()).recursive(true).allow_not_found(true);
        let lister = PrefixLister::new(ctx.clone(), &bucket, "", &sub, tx.clone());
        tasks.spawn_on(lister.run(), &handle);
    }

    // All bucket listers finish before the store listing does.
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let res = joined.map_err(|e| FsError::Io(format!("bucket listing task failed: {}", e)))?;
        if let Err(e) = res {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Sequential page walker for one bucket and prefix.
struct PrefixLister {
    ctx: ListContext,
    tx: BatchSender,
    bucket: String,
    /// Request prefix: the base key plus a separator, or empty for a whole bucket.
    prefix: String,
    recursive: bool,
    max_recursion: u32,
    allow_not_found: bool,
    /// Directories already emitted, as full paths.
    directories: HashSet<String>,
    empty: bool,
}

impl PrefixLister {
    fn new(ctx: ListContext, bucket: &str, key: &str, selector: &FileSelector, tx: BatchSender) -> Self {
        let prefix = if key.is_empty() { String::new() } else { format!("{}{}", key, SEP) };
        Self {
            ctx,
            tx,
            bucket: bucket.to_string(),
            prefix,
            recursive: selector.recursive,
            max_recursion: selector.max_recursion,
            allow_not_found: selector.allow_not_found,
            directories: HashSet::new(),
            empty: true,
        }
    }

    async fn run(mut self) -> Result<()> {
        let mut continuation_token = None;
        let mut pages = 0usize;
        loop {
            self.ctx.io.check_cancelled()?;
            let req = ListRequest {
                bucket: self.bucket.clone(),
                prefix: (!self.prefix.is_empty()).then(|| self.prefix.clone()),
                delimiter: (!self.recursive).then(|| SEP.to_string()),
                continuation_token: continuation_token.take(),
                max_keys: Some(self.ctx.max_keys),
            };
            let outcome = self
                .ctx
                .io
                .run(async {
                    let client = self.ctx.holder.lock().await?;
                    Ok::<_, FsError>(client.list_objects(&req).await)
                })
                .await?;
            let page = match outcome {
                Ok(page) => page,
                Err(detail) if self.allow_not_found && is_not_found(&detail) => return Ok(()),
                Err(detail) => {
                    return Err(FsError::provider(
                        "listing objects under key",
                        format!("{}{}{}", self.bucket, SEP, self.prefix),
                        detail,
                    ));
                }
            };
            pages += 1;
            trace!(
                "listing {}/{} page {}: {} objects, {} prefixes",
                self.bucket,
                self.prefix,
                pages,
                page.objects.len(),
                page.common_prefixes.len()
            );

            let infos = self.to_file_infos(&page);
            if !infos.is_empty() && self.tx.send(Ok(infos)).await.is_err() {
                // Consumer went away.
                return Ok(());
            }

            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation_token = Some(token),
                _ => break,
            }
        }
        self.finish()
    }

    fn finish(&self) -> Result<()> {
        // Nothing under a non-empty prefix, not even the marker itself.
        if self.empty && !self.allow_not_found && !self.prefix.is_empty() {
            return Err(FsError::NotFound(format!(
                "{}{}{}",
                self.bucket,
                SEP,
                remove_trailing_slash(&self.prefix)
            )));
        }
        Ok(())
    }

    fn to_file_infos(&mut self, page: &ListPage) -> Vec<FileInfo> {
        let mut infos = Vec::new();

        for child_prefix in &page.common_prefixes {
            let child_key = remove_trailing_slash(child_prefix);
            infos.push(FileInfo::directory(format!("{}{}{}", self.bucket, SEP, child_key)));
        }

        let base_depth = path_depth(&self.prefix) as i64;
        let max_recursion = self.max_recursion as i64;
        for obj in &page.objects {
            if obj.key == self.prefix {
                // The base marker itself proves the base exists.
                self.empty = false;
                continue;
            }
            let child_key = remove_trailing_slash(&obj.key);
            let had_trailing_slash = child_key.len() != obj.key.len();
            let child_depth = path_depth(child_key) as i64;
            let recursion_depth = child_depth - base_depth - 1;

            let child_path = if recursion_depth > max_recursion {
                // Too deep to report, but its ancestors within range still count.
                let to_trim = recursion_depth - max_recursion - 1;
                if to_trim > 0 {
                    let kept = (child_depth - to_trim) as usize;
                    format!("{}{}{}", self.bucket, SEP, slice_path(child_key, 0, kept))
                } else {
                    format!("{}{}{}", self.bucket, SEP, child_key)
                }
            } else {
                let child_path = format!("{}{}{}", self.bucket, SEP, child_key);
                if obj.size > 0 || !had_trailing_slash {
                    infos.push(FileInfo::file(child_path.clone(), obj.size, obj.last_modified));
                } else if self.directories.insert(child_path.clone()) {
                    infos.push(FileInfo::directory(child_path.clone()));
                }
                child_path
            };

            for dir in self.new_directories(&child_path) {
                infos.push(FileInfo::directory(dir));
            }
        }

        if !infos.is_empty() {
            self.empty = false;
        }
        infos
    }

    /// Ancestors of `path` below the base that have not been emitted yet.
    fn new_directories(&mut self, path: &str) -> Vec<String> {
        let base = if self.prefix.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}{}{}", self.bucket, SEP, remove_trailing_slash(&self.prefix))
        };
        let mut new_dirs = Vec::new();
        let mut current = path;
        loop {
            let parent = split_parent(current).0;
            if parent.is_empty() || parent == base {
                break;
            }
            current = parent;
            if self.directories.insert(parent.to_string()) {
                new_dirs.push(parent.to_string());
            }
        }
        new_dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ObjectEntry;
    use crate::lifecycle::Finalizer;
    use crate::memory::MemoryClient;

    async fn lister(key: &str, selector: &FileSelector) -> PrefixLister {
        let finalizer = Finalizer::new();
        let holder = finalizer.add_client(Arc::new(MemoryClient::new())).await.unwrap();
        let ctx = ListContext { holder, io: IoContext::new(4).unwrap(), max_keys: 1000 };
        let (tx, _rx) = mpsc::channel(1);
        PrefixLister::new(ctx, "bucket", key, selector, tx)
    }

    fn entry(key: &str, size: u64) -> ObjectEntry {
        ObjectEntry { key: key.to_string(), size, last_modified: None }
    }

    fn page(keys: &[(&str, u64)]) -> ListPage {
        ListPage {
            objects: keys.iter().map(|(k, s)| entry(k, *s)).collect(),
            ..Default::default()
        }
    }

    fn summary(infos: &[FileInfo]) -> Vec<(String, FileType)> {
        infos.iter().map(|i| (i.path.clone(), i.file_type)).collect()
    }

    #[tokio::test]
    async fn max_recursion_zero_reports_only_ancestor() {
        let sel = FileSelector::new("bucket/a").recursive(true).max_recursion(0);
        let mut l = lister("a", &sel).await;
        let infos = l.to_file_infos(&page(&[("a/b/c", 3)]));
        assert_eq!(summary(&infos), vec![("bucket/a/b".to_string(), FileType::Directory)]);
    }

    #[tokio::test]
    async fn max_recursion_one_reports_file_and_dir() {
        let sel = FileSelector::new("bucket/a").recursive(true).max_recursion(1);
        let mut l = lister("a", &sel).await;
        let infos = l.to_file_infos(&page(&[("a/b/c", 3)]));
        assert_eq!(
            summary(&infos),
            vec![
                ("bucket/a/b/c".to_string(), FileType::File),
                ("bucket/a/b".to_string(), FileType::Directory),
            ]
        );
    }

    #[tokio::test]
    async fn implicit_directories_emitted_once_across_pages() {
        let sel = FileSelector::new("bucket").recursive(true);
        let mut l = lister("", &sel).await;
        let first = l.to_file_infos(&page(&[("x/y/1", 1), ("x/y/2", 1)]));
        let second = l.to_file_infos(&page(&[("x/y/3", 1), ("x/", 0)]));
        let dirs: Vec<_> = first
            .iter()
            .chain(second.iter())
            .filter(|i| i.is_dir())
            .map(|i| i.path.as_str())
            .collect();
        assert_eq!(dirs, vec!["bucket/x/y", "bucket/x"]);
    }

    #[tokio::test]
    async fn base_marker_marks_found_but_is_skipped() {
        let sel = FileSelector::new("bucket/d");
        let mut l = lister("d", &sel).await;
        let infos = l.to_file_infos(&page(&[("d/", 0)]));
        assert!(infos.is_empty());
        assert!(!l.empty);
        assert!(l.finish().is_ok());
    }

    #[tokio::test]
    async fn empty_prefix_listing_is_not_found() {
        let sel = FileSelector::new("bucket/missing");
        let mut l = lister("missing", &sel).await;
        let _ = l.to_file_infos(&ListPage::default());
        assert!(matches!(l.finish(), Err(FsError::NotFound(p)) if p == "bucket/missing"));
    }

    #[tokio::test]
    async fn zero_size_trailing_slash_is_directory() {
        let sel = FileSelector::new("bucket").recursive(true);
        let mut l = lister("", &sel).await;
        let infos = l.to_file_infos(&page(&[("empty", 0), ("dir/", 0)]));
        assert_eq!(
            summary(&infos),
            vec![
                ("bucket/empty".to_string(), FileType::File),
                ("bucket/dir".to_string(), FileType::Directory),
            ]
        );
    }

    #[test]
    fn file_info_helpers() {
        let info = FileInfo::file("b/dir/name.txt", 4, None);
        assert_eq!(info.base_name(), "name.txt");
        assert!(info.is_file() && info.exists());
        assert!(!FileInfo::not_found("b/x").exists());
    }
}
