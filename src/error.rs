// src/error.rs
//
// Error taxonomy for the filesystem layer, plus the provider error detail that
// every `ObjectClient` call fails with.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// Raw error information reported by the object store for one failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Provider error code, e.g. `NoSuchKey` or `InternalError`.
    pub code: Option<String>,
    pub message: Option<String>,
    /// Exception name as reported by the SDK when it differs from the code.
    pub exception_name: Option<String>,
    pub http_status: Option<u16>,
    /// Value of the `Server` response header, used for backend detection.
    pub server: Option<String>,
    /// Whether the transport considers the failure transient.
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Name to report: the exception name if known, else the code.
    pub fn name(&self) -> &str {
        self.exception_name
            .as_deref()
            .or(self.code.as_deref())
            .unwrap_or("Unknown")
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP status {})", status)?;
        }
        if let Some(msg) = self.message.as_deref().filter(|m| !m.is_empty()) {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorDetail {}

/// One key that failed inside a batched delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyError {
    pub key: String,
    pub detail: ErrorDetail,
}

#[derive(Error, Debug, Clone)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path does not exist '{0}'")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("S3 subsystem is finalized")]
    SubsystemFinalized,

    /// A failed remote call, wrapped with the operation and path(s) involved.
    #[error("when {operation} '{context}': AWS Error {detail}")]
    Provider {
        operation: String,
        context: String,
        detail: ErrorDetail,
    },

    #[error("{}", format_batch_failure(.bucket, .failures))]
    PartialBatchFailure {
        bucket: String,
        failures: Vec<KeyError>,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Contract violation by the caller (closed stream, bad argument, bad option).
    #[error("invalid: {0}")]
    Invalid(String),

    /// Filesystem-semantics failure not covered by a more specific variant.
    #[error("{0}")]
    Io(String),

    #[error("operation cancelled")]
    Cancelled,
}

fn format_batch_failure(bucket: &str, failures: &[KeyError]) -> String {
    let mut msg = format!(
        "Got the following {} errors when deleting objects in S3 bucket '{}':",
        failures.len(),
        bucket
    );
    for f in failures {
        msg.push_str(&format!("\n- key '{}': {}", f.key, f.detail));
    }
    msg
}

impl FsError {
    pub fn provider(
        operation: impl Into<String>,
        context: impl Into<String>,
        detail: ErrorDetail,
    ) -> Self {
        FsError::Provider {
            operation: operation.into(),
            context: context.into(),
            detail,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Provider detail carried by this error, if any.
    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            FsError::Provider { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_names_operation_and_path() {
        let err = FsError::provider(
            "listing objects under key",
            "bucket/dir",
            ErrorDetail::new("AccessDenied", "nope").with_status(403),
        );
        assert_eq!(
            err.to_string(),
            "when listing objects under key 'bucket/dir': AWS Error AccessDenied (HTTP status 403): nope"
        );
    }

    #[test]
    fn batch_failure_lists_every_key() {
        let err = FsError::PartialBatchFailure {
            bucket: "b".into(),
            failures: vec![
                KeyError { key: "x".into(), detail: ErrorDetail::new("AccessDenied", "denied") },
                KeyError { key: "y/".into(), detail: ErrorDetail::new("InternalError", "oops") },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Got the following 2 errors when deleting objects in S3 bucket 'b':"));
        assert!(msg.contains("- key 'x': AccessDenied: denied"));
        assert!(msg.contains("- key 'y/': InternalError: oops"));
    }
}
