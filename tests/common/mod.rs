// tests/common/mod.rs
//
// Shared setup: an `S3FileSystem` over an in-memory store with its own finalizer.

#![allow(dead_code)]

use std::sync::Arc;

use s3fs::{Finalizer, FsOptions, MemoryClient, S3FileSystem};

/// Small parts so multipart paths run with tiny payloads.
pub const PART_SIZE: usize = 16;

pub struct TestFs {
    pub fs: S3FileSystem,
    pub client: Arc<MemoryClient>,
    /// Holders only keep a weak reference; dropping this finalizes the filesystem.
    pub finalizer: Arc<Finalizer>,
}

pub fn options() -> FsOptions {
    FsOptions::default().with_part_size(PART_SIZE).with_io_concurrency(8)
}

pub async fn setup_with(client: MemoryClient, options: FsOptions) -> TestFs {
    let client = Arc::new(client);
    let finalizer = Finalizer::new();
    let fs = S3FileSystem::with_finalizer(client.clone(), options, &finalizer)
        .await
        .expect("filesystem setup");
    TestFs { fs, client, finalizer }
}

/// AWS-flavoured store with one bucket, `bucket`.
pub async fn setup() -> TestFs {
    let client = MemoryClient::new();
    client.add_bucket("bucket");
    setup_with(client, options()).await
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
