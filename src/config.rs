// src/config.rs
//
// Options for an S3 filesystem, with environment overrides.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PART_UPLOAD_SIZE, DEFAULT_REQUEST_TIMEOUT,
    LIST_OBJECTS_MAX_KEYS, MIN_PART_UPLOAD_SIZE,
};
use crate::error::{FsError, Result};
use crate::retry::{AwsDefaultRetryStrategy, AwsStandardRetryStrategy, RetryStrategy, default_retry_strategy};

/// Options for [`crate::S3FileSystem`].
#[derive(Debug, Clone)]
pub struct FsOptions {
    /// AWS region; resolved from the environment/profile chain when `None`.
    pub region: Option<String>,
    /// Endpoint override, e.g. `localhost:9000` or `http://minio:9000`.
    pub endpoint_override: Option<String>,
    /// `http` or `https`; applied to an endpoint override without a scheme.
    pub scheme: String,
    pub force_path_style: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// PEM bundle of trusted CAs.
    pub tls_ca_file_path: Option<String>,

    /// Policy for retrying errors embedded in successful CompleteMultipartUpload responses.
    pub retry_strategy: Arc<dyn RetryStrategy>,

    /// Whether `create_dir` may create a missing bucket.
    pub allow_bucket_creation: bool,
    /// Whether `delete_dir` may delete a bucket.
    pub allow_bucket_deletion: bool,
    /// Probe for existing entries before creating directory markers.
    pub check_directory_existence_before_creation: bool,

    /// Upload parts and single-request objects on the I/O pool.
    pub background_writes: bool,
    /// Defer the upload decision until close.  When off, a multipart upload is
    /// created as soon as a stream is opened, surfacing permission errors early.
    pub allow_delayed_open: bool,
    /// Metadata for new objects when a stream is opened without any.
    pub default_metadata: BTreeMap<String, String>,
    pub part_size: usize,

    /// Maximum number of remote calls in flight per filesystem.
    pub io_concurrency: usize,
    pub list_max_keys: i32,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_override: None,
            scheme: "https".to_string(),
            force_path_style: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tls_ca_file_path: None,
            retry_strategy: default_retry_strategy(),
            allow_bucket_creation: false,
            allow_bucket_deletion: false,
            check_directory_existence_before_creation: false,
            background_writes: true,
            allow_delayed_open: false,
            default_metadata: BTreeMap::new(),
            part_size: DEFAULT_PART_UPLOAD_SIZE,
            io_concurrency: (num_cpus::get() * 2).clamp(4, 64),
            list_max_keys: LIST_OBJECTS_MAX_KEYS,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| {
        matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on" | "enable")
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

impl FsOptions {
    /// Options from `.env` and the process environment.
    ///
    /// Reads `AWS_REGION`, `AWS_ENDPOINT_URL`, `AWS_CA_BUNDLE_PATH` and the
    /// `S3FS_*` overrides.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut opts = Self::default();

        opts.region = env_string("AWS_REGION").or_else(|| env_string("AWS_DEFAULT_REGION"));
        opts.endpoint_override = env_string("AWS_ENDPOINT_URL");
        opts.tls_ca_file_path = env_string("AWS_CA_BUNDLE_PATH");
        if let Some(scheme) = env_string("S3FS_SCHEME") {
            opts.scheme = scheme;
        }
        if let Some(secs) = env_parse::<u64>("S3FS_CONNECT_TIMEOUT_SECS") {
            opts.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("S3FS_OPERATION_TIMEOUT_SECS") {
            opts.request_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_flag("S3FS_ALLOW_BUCKET_CREATION") {
            opts.allow_bucket_creation = v;
        }
        if let Some(v) = env_flag("S3FS_ALLOW_BUCKET_DELETION") {
            opts.allow_bucket_deletion = v;
        }
        if let Some(v) = env_flag("S3FS_CHECK_DIRECTORY_EXISTENCE") {
            opts.check_directory_existence_before_creation = v;
        }
        if let Some(v) = env_flag("S3FS_BACKGROUND_WRITES") {
            opts.background_writes = v;
        }
        if let Some(v) = env_flag("S3FS_ALLOW_DELAYED_OPEN") {
            opts.allow_delayed_open = v;
        }
        if let Some(n) = env_parse::<usize>("S3FS_IO_CONCURRENCY") {
            opts.io_concurrency = n;
        }
        if let Some(n) = env_parse::<usize>("S3FS_PART_SIZE") {
            opts.part_size = n;
        }
        match env_string("S3FS_RETRY_STRATEGY").as_deref() {
            Some("standard") => {
                let attempts = env_parse("S3FS_RETRY_MAX_ATTEMPTS").unwrap_or(3);
                opts.retry_strategy = Arc::new(AwsStandardRetryStrategy::new(attempts));
            }
            Some("default") | None => {
                if let Some(attempts) = env_parse("S3FS_RETRY_MAX_ATTEMPTS") {
                    opts.retry_strategy = Arc::new(AwsDefaultRetryStrategy::new(attempts));
                }
            }
            Some(other) => tracing::warn!("ignoring unknown S3FS_RETRY_STRATEGY '{}'", other),
        }
        opts
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_background_writes(mut self, enabled: bool) -> Self {
        self.background_writes = enabled;
        self
    }

    pub fn with_delayed_open(mut self, enabled: bool) -> Self {
        self.allow_delayed_open = enabled;
        self
    }

    pub fn with_bucket_creation(mut self, enabled: bool) -> Self {
        self.allow_bucket_creation = enabled;
        self
    }

    pub fn with_bucket_deletion(mut self, enabled: bool) -> Self {
        self.allow_bucket_deletion = enabled;
        self
    }

    pub fn with_existence_check(mut self, enabled: bool) -> Self {
        self.check_directory_existence_before_creation = enabled;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_io_concurrency(mut self, n: usize) -> Self {
        self.io_concurrency = n;
        self
    }

    pub fn with_default_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.default_metadata = metadata;
        self
    }

    /// Region to use for bucket creation and the client.
    pub fn effective_region(&self) -> &str {
        self.region.as_deref().unwrap_or(crate::constants::DEFAULT_REGION)
    }

    /// Endpoint URL with the configured scheme applied when missing.
    pub fn endpoint_url(&self) -> Result<Option<String>> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(FsError::Invalid(format!(
                "Invalid S3 connection scheme '{}'",
                self.scheme
            )));
        }
        Ok(self.endpoint_override.as_ref().map(|ep| {
            if ep.contains("://") {
                ep.clone()
            } else {
                format!("{}://{}", self.scheme, ep)
            }
        }))
    }

    /// Check option values that do not depend on the endpoint.
    ///
    /// `part_size` may go below the AWS minimum so tests can exercise
    /// multipart logic with small payloads; a warning is logged instead.
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(FsError::Invalid("part_size must be > 0".into()));
        }
        if self.part_size < MIN_PART_UPLOAD_SIZE {
            tracing::warn!(
                "part_size {} is below the S3 minimum of {} bytes; only in-memory stores accept it",
                self.part_size,
                MIN_PART_UPLOAD_SIZE
            );
        }
        if self.list_max_keys <= 0 {
            return Err(FsError::Invalid("list_max_keys must be > 0".into()));
        }
        self.endpoint_url()?;
        Ok(())
    }
}
