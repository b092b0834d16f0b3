// src/constants.rs
//
// Centralized constants for s3fs to avoid hardcoded values throughout the codebase

use std::time::Duration;

/// Separator between path segments, and between bucket and key
pub const SEP: char = '/';

/// Default multipart part size (10 MiB)
///
/// Must be at least 5 MiB for AWS.  R2 additionally requires all parts but the
/// last to have the same size, so the part size is fixed per deployment.
/// 10 MiB * 10 000 parts gives roughly 98 GiB per object.
pub const DEFAULT_PART_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Smallest part size accepted by AWS S3 for non-final parts
pub const MIN_PART_UPLOAD_SIZE: usize = 5 * 1024 * 1024;

/// Maximum number of parts in a multipart upload
pub const MAX_MULTIPART_PARTS: usize = 10_000;

/// Maximum number of keys requested per ListObjectsV2 page
pub const LIST_OBJECTS_MAX_KEYS: i32 = 1000;

/// Maximum number of keys in a single DeleteObjects request
pub const MULTIPLE_DELETE_MAX_KEYS: usize = 1000;

/// Number of listing batches buffered between producer and consumer
pub const LISTING_CHANNEL_CAPACITY: usize = 16;

/// Content type used by several tools to tag directory markers
pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

/// Content type used when the caller supplied none
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Region used when none can be resolved
pub const DEFAULT_REGION: &str = "us-east-1";

/// Bucket name used to probe the backend flavour; never expected to exist
pub const BACKEND_PROBE_BUCKET: &str = "$extremelyunlikelytoexist$";

/// Default connect timeout for the S3 client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation timeout for the S3 client
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of retry attempts for the default retry strategy
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;

/// Base delay of the default exponential retry strategy
pub const DEFAULT_RETRY_SCALE_FACTOR: Duration = Duration::from_millis(25);

/// Upper bound on any single delay computed by the standard retry strategy
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(20);
