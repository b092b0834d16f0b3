// src/lib.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// Crate root: module declarations and the public re-exports.
//
// `s3fs` presents an S3 bucket namespace as a filesystem.  Directories are
// emulated with zero-length marker objects and key prefixes; large writes go
// up as multipart uploads; listings are paginated streams; and a process-wide
// finalizer guards every client against use after shutdown.

pub mod constants;
pub mod config;
pub mod error;
pub mod path;
pub mod retry;

pub mod client;
pub mod memory;
pub mod s3_client;

pub mod io_context;
pub mod lifecycle;

pub mod listing;
pub mod reader;
pub mod upload;

pub mod fs;

pub use client::{ObjectAttributes, ObjectClient, ObjectHead};
pub use config::FsOptions;
pub use error::{ErrorDetail, FsError, KeyError, Result};
pub use fs::S3FileSystem;
pub use lifecycle::{Finalizer, finalize, finalize_blocking};
pub use listing::{FileInfo, FileInfoStream, FileSelector, FileType};
pub use memory::MemoryClient;
pub use path::ObjectPath;
pub use reader::ObjectReader;
pub use retry::{AwsDefaultRetryStrategy, AwsStandardRetryStrategy, Backend, RetryStrategy};
pub use s3_client::S3Client;
pub use upload::ObjectWriter;
