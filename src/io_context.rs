// src/io_context.rs
//
// Execution context for remote calls: a runtime handle, a semaphore bounding
// the number of calls in flight, and a cooperative cancellation token.
// Also owns the background runtime used by the blocking entry points.

use std::future::Future;
use std::sync::{Arc, mpsc};
use std::thread;

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder as TokioBuilder, Handle};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FsError, Result};

static RT_HANDLE: OnceCell<Handle> = OnceCell::new();

/// Create (once) a background multi-thread runtime and return its handle.
fn global_rt_handle() -> Result<&'static Handle> {
    RT_HANDLE.get_or_try_init(|| {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("s3fs-rt".to_string())
            .spawn(move || {
                let threads = runtime_threads();
                debug!("Creating Tokio runtime with {} worker threads", threads);
                let rt = match TokioBuilder::new_multi_thread()
                    .enable_all()
                    .worker_threads(threads)
                    .thread_name("s3fs-rt-worker")
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = tx.send(Ok(rt.handle().clone()));
                rt.block_on(std::future::pending::<()>());
            })
            .map_err(|e| FsError::Io(format!("failed to spawn s3fs runtime thread: {}", e)))?;

        rx.recv()
            .map_err(|_| FsError::Io("s3fs runtime thread exited during startup".into()))?
            .map_err(|e| FsError::Io(format!("failed to build s3fs runtime: {}", e)))
    })
}

fn runtime_threads() -> usize {
    std::env::var("S3FS_RT_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| num_cpus::get().clamp(2, 16))
}

/// Run `fut` on the background runtime and block the current thread until it completes.
///
/// Works from plain threads and from inside another runtime alike, since the
/// future never runs on the caller's executor.
pub fn block_on<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = global_rt_handle()?.clone();
    let (tx, rx) = mpsc::channel();
    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .map_err(|_| FsError::Io("background runtime task crashed".into()))?
}

/// Runtime handle, concurrency bound and stop token shared by one filesystem.
#[derive(Debug, Clone)]
pub struct IoContext {
    handle: Handle,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
}

impl IoContext {
    /// Context on the current runtime if there is one, else on the background runtime.
    pub fn new(max_in_flight: usize) -> Result<Self> {
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(_) => global_rt_handle()?.clone(),
        };
        Ok(Self::with_handle(handle, max_in_flight))
    }

    pub fn with_handle(handle: Handle, max_in_flight: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            stop: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Signal cancellation; no new pages or parts are submitted afterwards.
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Fail with `Cancelled` once the stop token has fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(FsError::Cancelled);
        }
        Ok(())
    }

    /// Run `fut` once a slot is available.  In-flight work is never interrupted.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check_cancelled()?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FsError::Io("I/O pool closed".into()))?;
        fut.await
    }

    /// Spawn `fut` on the runtime, bounded like [`IoContext::run`].
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.clone();
        self.handle.spawn(async move { ctx.run(fut).await })
    }
}
