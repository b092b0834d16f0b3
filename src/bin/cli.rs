// src/bin/cli.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Command line front-end for `s3fs`.
//!
//! Examples:
//! ```bash
//! s3fs-cli buckets
//! s3fs-cli ls    my-bucket/data -r --max-depth 2
//! s3fs-cli stat  my-bucket/data/file.bin
//! s3fs-cli mkdir my-bucket/a/b/c -p
//! s3fs-cli put   ./local.bin my-bucket/data/file.bin
//! s3fs-cli get   my-bucket/data/file.bin ./copy.bin
//! s3fs-cli mv    my-bucket/data/file.bin my-bucket/archive/file.bin
//! s3fs-cli rmdir my-bucket/archive
//! ```

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use s3fs::{FileSelector, FileType, FsOptions, S3FileSystem};

/// Print to stdout, exiting quietly on a broken pipe.
macro_rules! safe_println {
    ($($arg:tt)*) => {
        match writeln!(io::stdout(), $($arg)*) {
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                std::process::exit(0);
            }
            Err(e) => return Err(e.into())
        }
    };
}

const COPY_CHUNK: usize = 8 * 1024 * 1024;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(
        short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity: -v = Info, -vv = Debug",
    )]
    verbose: u8,

    /// Endpoint override, e.g. http://localhost:9000 (defaults to AWS_ENDPOINT_URL).
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Region (defaults to AWS_REGION).
    #[arg(long, global = true)]
    region: Option<String>,

    /// Allow `mkdir` to create buckets.
    #[arg(long, global = true)]
    allow_bucket_creation: bool,

    /// Allow `rmdir` to delete buckets.
    #[arg(long, global = true)]
    allow_bucket_deletion: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all buckets.
    Buckets,

    /// List a directory.
    Ls {
        path: String,
        #[arg(short, long)]
        recursive: bool,
        /// Deepest level to report below the directory (0 = direct children).
        #[arg(long)]
        max_depth: Option<u32>,
        /// Print nothing instead of failing when the directory does not exist.
        #[arg(long)]
        allow_not_found: bool,
    },

    /// Show type, size and modification time of a path.
    Stat { path: String },

    /// Create a directory.
    Mkdir {
        path: String,
        /// Create missing parents too.
        #[arg(short, long)]
        parents: bool,
    },

    /// Delete a file.
    Rm { path: String },

    /// Delete a directory and everything under it.
    Rmdir {
        path: String,
        /// Keep the directory itself and only delete its contents.
        #[arg(long)]
        contents_only: bool,
    },

    /// Move a file.
    Mv { src: String, dest: String },

    /// Copy a file server side.
    Cp { src: String, dest: String },

    /// Upload a local file.
    Put {
        local: PathBuf,
        dest: String,
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Download a file.
    Get { src: String, local: PathBuf },
}

/// Accept `s3://bucket/key` as well as `bucket/key`.
fn fs_path(s: &str) -> &str {
    s.strip_prefix("s3://").unwrap_or(s)
}

fn type_name(t: FileType) -> &'static str {
    match t {
        FileType::File => "file",
        FileType::Directory => "dir",
        FileType::NotFound => "not-found",
        FileType::Unknown => "unknown",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
    // Capture `log` records from the AWS SDK.
    tracing_log::LogTracer::init().ok();

    let mut options = FsOptions::from_env();
    if let Some(endpoint) = cli.endpoint {
        options = options.with_endpoint(endpoint);
    }
    if let Some(region) = cli.region {
        options = options.with_region(region);
    }
    if cli.allow_bucket_creation {
        options = options.with_bucket_creation(true);
    }
    if cli.allow_bucket_deletion {
        options = options.with_bucket_deletion(true);
    }

    let fs = S3FileSystem::connect(options).await.context("failed to set up S3 filesystem")?;
    let res = run(&fs, cli.cmd).await;
    s3fs::finalize().await;
    res
}

async fn run(fs: &S3FileSystem, cmd: Command) -> Result<()> {
    match cmd {
        Command::Buckets => {
            let buckets = fs.get_file_info_list(FileSelector::new("")).await?;
            for b in buckets {
                safe_println!("{}", b.path);
            }
        }

        Command::Ls { path, recursive, max_depth, allow_not_found } => {
            let mut selector = FileSelector::new(fs_path(&path))
                .recursive(recursive)
                .allow_not_found(allow_not_found);
            if let Some(depth) = max_depth {
                selector = selector.max_recursion(depth);
            }
            let mut stream = fs.get_file_info_stream(selector);
            let mut count = 0usize;
            while let Some(batch) = stream.next().await {
                for entry in batch? {
                    count += 1;
                    match entry.size {
                        Some(size) => safe_println!("{:<5} {:>14} {}", type_name(entry.file_type), size, entry.path),
                        None => safe_println!("{:<5} {:>14} {}", type_name(entry.file_type), "-", entry.path),
                    }
                }
            }
            info!("listed {} entries", count);
        }

        Command::Stat { path } => {
            let info = fs.get_file_info(fs_path(&path)).await?;
            safe_println!("Path    : {}", info.path);
            safe_println!("Type    : {}", type_name(info.file_type));
            if let Some(size) = info.size {
                safe_println!("Size    : {}", size);
            }
            if let Some(mtime) = info.mtime {
                safe_println!("Modified: {}", mtime);
            }
        }

        Command::Mkdir { path, parents } => {
            fs.create_dir(fs_path(&path), parents).await?;
        }

        Command::Rm { path } => {
            fs.delete_file(fs_path(&path)).await?;
        }

        Command::Rmdir { path, contents_only } => {
            if contents_only {
                fs.delete_dir_contents(fs_path(&path), false).await?;
            } else {
                fs.delete_dir(fs_path(&path)).await?;
            }
        }

        Command::Mv { src, dest } => {
            fs.move_file(fs_path(&src), fs_path(&dest)).await?;
        }

        Command::Cp { src, dest } => {
            fs.copy_file(fs_path(&src), fs_path(&dest)).await?;
        }

        Command::Put { local, dest, content_type } => {
            let start = Instant::now();
            let mut file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("cannot open {}", local.display()))?;
            let metadata: BTreeMap<String, String> = content_type
                .into_iter()
                .map(|ct| ("Content-Type".to_string(), ct))
                .collect();
            let mut writer = fs.open_output_stream(fs_path(&dest), Some(&metadata)).await?;
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n]).await?;
            }
            let total = writer.tell()?;
            writer.close().await?;
            safe_println!("uploaded {} bytes to {} in {:.2?}", total, dest, start.elapsed());
        }

        Command::Get { src, local } => {
            let start = Instant::now();
            let mut reader = fs.open_input_file(fs_path(&src)).await?;
            let mut out = tokio::fs::File::create(&local)
                .await
                .with_context(|| format!("cannot create {}", local.display()))?;
            loop {
                let chunk = reader.read(COPY_CHUNK as u64).await?;
                if chunk.is_empty() {
                    break;
                }
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            let size = reader.size()?;
            if reader.tell()? != size {
                bail!("short read from {}: {} of {} bytes", src, reader.tell()?, size);
            }
            safe_println!("downloaded {} bytes from {} in {:.2?}", size, src, start.elapsed());
        }
    }
    Ok(())
}
