// src/client.rs
//
// The object-store primitives this crate is built on.  `S3Client` implements
// them over the AWS SDK, `MemoryClient` implements them in process.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{ErrorDetail, KeyError};

pub type ClientResult<T> = std::result::Result<T, ErrorDetail>;

/// Response of a HeadObject call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub e_tag: Option<String>,
    pub version_id: Option<String>,
    pub cache_control: Option<String>,
    pub content_language: Option<String>,
    pub expires: Option<String>,
}

/// Attributes attached to an object on Put or CreateMultipartUpload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_language: Option<String>,
    pub expires: Option<String>,
    pub acl: Option<String>,
}

impl ObjectAttributes {
    /// Build attributes from `Key: Value` metadata, ignoring unknown keys.
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Self {
        let mut attrs = Self::default();
        for (k, v) in metadata {
            match k.as_str() {
                "Content-Type" => attrs.content_type = Some(v.clone()),
                "Cache-Control" => attrs.cache_control = Some(v.clone()),
                "Content-Language" => attrs.content_language = Some(v.clone()),
                "Expires" => attrs.expires = Some(v.clone()),
                "ACL" => attrs.acl = Some(v.clone()),
                _ => tracing::debug!("ignoring unsupported object metadata key '{}'", k),
            }
        }
        attrs
    }
}

/// One object entry in a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A ListObjectsV2 request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: Option<i32>,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub key_count: usize,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Result of CompleteMultipartUpload.
///
/// Some backends answer 200 OK with an `<Error>` document in the body.  The
/// client reports that as `embedded_error` rather than failing the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteOutcome {
    pub e_tag: Option<String>,
    pub embedded_error: Option<ErrorDetail>,
}

/// Object-store primitives.  Every call fails with the provider's `ErrorDetail`.
#[async_trait]
pub trait ObjectClient: Send + Sync + Debug {
    async fn head_bucket(&self, bucket: &str) -> ClientResult<()>;
    async fn create_bucket(&self, bucket: &str, region: Option<&str>) -> ClientResult<()>;
    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()>;
    async fn list_buckets(&self) -> ClientResult<Vec<String>>;

    async fn head_object(&self, bucket: &str, key: &str) -> ClientResult<ObjectHead>;
    /// Read `length` bytes at `offset`; the result may be shorter at end of object.
    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> ClientResult<Bytes>;
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attrs: &ObjectAttributes,
    ) -> ClientResult<()>;
    /// Server-side copy; `source` is an url-encoded `bucket/key`.
    async fn copy_object(&self, source: &str, bucket: &str, key: &str) -> ClientResult<()>;
    async fn delete_object(&self, bucket: &str, key: &str) -> ClientResult<()>;
    /// Batched delete; returns the keys that failed.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> ClientResult<Vec<KeyError>>;

    async fn list_objects(&self, req: &ListRequest) -> ClientResult<ListPage>;

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attrs: &ObjectAttributes,
    ) -> ClientResult<String>;
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<String>;
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<CompleteOutcome>;
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ClientResult<()>;
}
