// src/retry.rs
//
// Retry policies, provider error classification and backend detection.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::constants::{DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_SCALE_FACTOR, MAX_RETRY_BACKOFF};
use crate::error::ErrorDetail;

/// Pluggable retry policy, consulted with the number of retries already made.
pub trait RetryStrategy: Send + Sync + Debug {
    fn should_retry(&self, detail: &ErrorDetail, attempted_retries: u32) -> bool;
    fn delay_before_retry(&self, detail: &ErrorDetail, attempted_retries: u32) -> Duration;
}

/// Bounded exponential backoff: no delay before the first retry, then
/// `25ms * 2^n`.  Only errors flagged retryable are retried.
#[derive(Debug, Clone)]
pub struct AwsDefaultRetryStrategy {
    pub max_attempts: u32,
    pub scale_factor: Duration,
}

impl Default for AwsDefaultRetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            scale_factor: DEFAULT_RETRY_SCALE_FACTOR,
        }
    }
}

impl AwsDefaultRetryStrategy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Default::default() }
    }
}

impl RetryStrategy for AwsDefaultRetryStrategy {
    fn should_retry(&self, detail: &ErrorDetail, attempted_retries: u32) -> bool {
        attempted_retries < self.max_attempts && is_retryable(detail)
    }

    fn delay_before_retry(&self, _detail: &ErrorDetail, attempted_retries: u32) -> Duration {
        if attempted_retries == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempted_retries.min(20)).unwrap_or(u32::MAX);
        self.scale_factor.saturating_mul(factor)
    }
}

/// Randomised exponential backoff with a cap, counting the first attempt
/// against `max_attempts`.
#[derive(Debug, Clone)]
pub struct AwsStandardRetryStrategy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for AwsStandardRetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_RETRY_SCALE_FACTOR,
            max_backoff: MAX_RETRY_BACKOFF,
        }
    }
}

impl AwsStandardRetryStrategy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Default::default() }
    }
}

impl RetryStrategy for AwsStandardRetryStrategy {
    fn should_retry(&self, detail: &ErrorDetail, attempted_retries: u32) -> bool {
        attempted_retries + 1 < self.max_attempts && is_retryable(detail)
    }

    fn delay_before_retry(&self, _detail: &ErrorDetail, attempted_retries: u32) -> Duration {
        let factor = 1u32.checked_shl(attempted_retries.min(20)).unwrap_or(u32::MAX);
        let ceiling = self.base_delay.saturating_mul(factor).min(self.max_backoff);
        let jitter: f64 = rand::rng().random_range(0.0..=1.0);
        ceiling.mul_f64(jitter)
    }
}

pub fn default_retry_strategy() -> Arc<dyn RetryStrategy> {
    Arc::new(AwsDefaultRetryStrategy::default())
}

// -----------------------------------------------------------------------------
// Error classification
// -----------------------------------------------------------------------------

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NoSuchUpload", "NotFound", "ResourceNotFound"];
const ALREADY_EXISTS_CODES: &[&str] = &["BucketAlreadyExists", "BucketAlreadyOwnedByYou"];
const THROTTLING_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

fn code_in(detail: &ErrorDetail, codes: &[&str]) -> bool {
    [detail.code.as_deref(), detail.exception_name.as_deref()]
        .into_iter()
        .flatten()
        .any(|c| codes.contains(&c))
}

pub fn is_not_found(detail: &ErrorDetail) -> bool {
    detail.http_status == Some(404) || code_in(detail, NOT_FOUND_CODES)
}

pub fn is_already_exists(detail: &ErrorDetail) -> bool {
    code_in(detail, ALREADY_EXISTS_CODES)
}

/// Transient per the transport, a throttling/internal code, or a 5xx status.
pub fn is_retryable(detail: &ErrorDetail) -> bool {
    detail.retryable
        || code_in(detail, THROTTLING_CODES)
        || detail.http_status.is_some_and(|s| s >= 500 || s == 429)
}

// -----------------------------------------------------------------------------
// Backend detection
// -----------------------------------------------------------------------------

/// Object-store implementation behind the endpoint, as far as it matters for quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Amazon,
    Minio,
    Other,
}

/// Detect the backend from the `Server` header carried by an error response.
pub fn detect_backend(detail: &ErrorDetail) -> Backend {
    match detail.server.as_deref() {
        Some(s) if s.starts_with("AmazonS3") => Backend::Amazon,
        Some(s) if s.starts_with("MinIO") => Backend::Minio,
        _ => Backend::Other,
    }
}

// -----------------------------------------------------------------------------
// Errors embedded in 200 OK bodies
// -----------------------------------------------------------------------------

static ROOT_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:<\?xml[^>]*\?>\s*)?<([A-Za-z_][\w.:-]*)").expect("valid root regex")
});
static ERROR_CHILD: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Errors?[\s/>]").expect("valid child regex"));
static CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<Code>(.*?)</Code>").expect("valid code regex"));
static MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Message>(.*?)</Message>").expect("valid message regex"));

/// Inspect a successful CompleteMultipartUpload body for an embedded error.
///
/// A body whose root is not `CompleteMultipartUploadResult`, or which has an
/// `Error`/`Errors` child, is an error.  Unparseable bodies are accepted.
pub fn parse_embedded_error(body: &[u8]) -> Option<ErrorDetail> {
    let text = std::str::from_utf8(body).ok()?;
    let root = ROOT_ELEMENT.captures(text)?.get(1)?.as_str();
    let after_root = &text[text.find(root).map(|i| i + root.len()).unwrap_or(0)..];
    if root == "CompleteMultipartUploadResult" && !ERROR_CHILD.is_match(after_root) {
        return None;
    }
    let code = CODE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| root.to_string());
    let message = MESSAGE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some(ErrorDetail {
        exception_name: Some(code.clone()),
        code: Some(code),
        message: Some(message),
        // Reported as a server error so the retry policy sees it as transient.
        http_status: Some(500),
        server: None,
        retryable: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_backoff() {
        let s = AwsDefaultRetryStrategy::default();
        let e = ErrorDetail::new("InternalError", "x").with_status(500);
        assert_eq!(s.delay_before_retry(&e, 0), Duration::ZERO);
        assert_eq!(s.delay_before_retry(&e, 1), Duration::from_millis(50));
        assert_eq!(s.delay_before_retry(&e, 3), Duration::from_millis(200));
        assert!(s.should_retry(&e, 0));
        assert!(s.should_retry(&e, 9));
        assert!(!s.should_retry(&e, 10));
        assert!(!s.should_retry(&ErrorDetail::new("AccessDenied", "no").with_status(403), 0));
    }

    #[test]
    fn standard_strategy_is_capped() {
        let s = AwsStandardRetryStrategy::new(3);
        let e = ErrorDetail::new("SlowDown", "x").with_status(503);
        assert!(s.should_retry(&e, 0));
        assert!(s.should_retry(&e, 1));
        assert!(!s.should_retry(&e, 2));
        for n in 0..30 {
            assert!(s.delay_before_retry(&e, n) <= MAX_RETRY_BACKOFF);
        }
    }

    #[test]
    fn classification() {
        assert!(is_not_found(&ErrorDetail::new("NoSuchKey", "")));
        assert!(is_not_found(&ErrorDetail::default().with_status(404)));
        assert!(!is_not_found(&ErrorDetail::new("AccessDenied", "").with_status(403)));
        assert!(is_already_exists(&ErrorDetail::new("BucketAlreadyOwnedByYou", "")));
    }

    #[test]
    fn backend_from_server_header() {
        let e = ErrorDetail::default();
        assert_eq!(detect_backend(&e), Backend::Other);
        assert_eq!(detect_backend(&e.clone().with_server("AmazonS3")), Backend::Amazon);
        assert_eq!(detect_backend(&e.clone().with_server("MinIO")), Backend::Minio);
        assert_eq!(detect_backend(&e.with_server("nginx")), Backend::Other);
    }

    #[test]
    fn embedded_error_detection() {
        let ok = br#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult><Bucket>b</Bucket><Key>k</Key><ETag>"x"</ETag></CompleteMultipartUploadResult>"#;
        assert!(parse_embedded_error(ok).is_none());
        assert!(parse_embedded_error(b"").is_none());

        let err = br#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>InternalError</Code><Message>We encountered an internal error. Please try again.</Message></Error>"#;
        let detail = parse_embedded_error(err).unwrap();
        assert_eq!(detail.code.as_deref(), Some("InternalError"));
        assert!(detail.message.as_deref().unwrap().starts_with("We encountered"));
        assert!(is_retryable(&detail));

        let nested = br#"<CompleteMultipartUploadResult><Error><Code>SlowDown</Code></Error></CompleteMultipartUploadResult>"#;
        assert_eq!(parse_embedded_error(nested).unwrap().code.as_deref(), Some("SlowDown"));
    }
}
