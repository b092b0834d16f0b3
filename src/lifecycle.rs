// src/lifecycle.rs
//
// Protection of S3 clients against use after process-wide finalization.
//
// Every client is wrapped in a `ClientHolder` registered with a `Finalizer`.
// Using the client takes the finalizer's lock in shared mode for the duration
// of one request; `finalize()` takes it exclusively only long enough to flip
// the finalized flag and swap out the registry, then drops the clients with
// no lock held.

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use once_cell::sync::Lazy;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};

use crate::client::ObjectClient;
use crate::error::{FsError, Result};
use crate::io_context;

#[derive(Debug, Default)]
struct FinalizerState {
    finalized: bool,
    holders: Vec<Weak<ClientHolder>>,
}

/// Registry of live clients plus an irreversible finalized flag.
#[derive(Debug, Default)]
pub struct Finalizer {
    state: Arc<RwLock<FinalizerState>>,
}

static GLOBAL_FINALIZER: Lazy<Arc<Finalizer>> = Lazy::new(Finalizer::new);

impl Finalizer {
    /// A fresh, independent finalizer.  Tests use this to avoid sharing the
    /// process-wide instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide finalizer, created on first use and never reset.
    pub fn global() -> Arc<Self> {
        GLOBAL_FINALIZER.clone()
    }

    /// Register a client; fails once finalized.  Expired entries are pruned.
    pub async fn add_client(self: &Arc<Self>, client: Arc<dyn ObjectClient>) -> Result<Arc<ClientHolder>> {
        let mut state = self.state.write().await;
        if state.finalized {
            return Err(FsError::SubsystemFinalized);
        }
        state.holders.retain(|h| h.strong_count() > 0);

        let holder = Arc::new(ClientHolder {
            finalizer: Arc::downgrade(self),
            client: Mutex::new(Some(client)),
        });
        state.holders.push(Arc::downgrade(&holder));
        debug!("registered S3 client ({} live)", state.holders.len());
        Ok(holder)
    }

    /// Finalize every registered client.  Subsequent calls are no-ops.
    pub async fn finalize(&self) {
        let holders = {
            let mut state = self.state.write().await;
            if state.finalized {
                return;
            }
            state.finalized = true;
            std::mem::take(&mut state.holders)
        };

        // Teardown happens with no lock held.
        let mut count = 0usize;
        for holder in holders.iter().filter_map(Weak::upgrade) {
            holder.finalize();
            count += 1;
        }
        info!("S3 subsystem finalized ({} clients released)", count);
    }

    /// Blocking variant of [`Finalizer::finalize`], usable from any thread.
    pub fn finalize_blocking(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        io_context::block_on(async move {
            this.finalize().await;
            Ok(())
        })
    }

    pub async fn is_finalized(&self) -> bool {
        self.state.read().await.finalized
    }

    /// Number of registered clients still alive.
    pub async fn live_clients(&self) -> usize {
        self.state
            .read()
            .await
            .holders
            .iter()
            .filter(|h| h.strong_count() > 0)
            .count()
    }
}

/// Finalize the process-wide S3 subsystem.
///
/// Every filesystem built on the global finalizer, before or after this call,
/// fails its subsequent operations with `SubsystemFinalized`.
pub async fn finalize() {
    Finalizer::global().finalize().await
}

pub fn finalize_blocking() -> Result<()> {
    Finalizer::global().finalize_blocking()
}

/// Shared cell holding a live client, emptied on finalization.
#[derive(Debug)]
pub struct ClientHolder {
    finalizer: Weak<Finalizer>,
    client: Mutex<Option<Arc<dyn ObjectClient>>>,
}

impl ClientHolder {
    /// Obtain scoped access to the client.
    ///
    /// The returned lock must be dropped before calling `lock()` again from the
    /// same task: holding two while a finalize is pending would stall.
    pub async fn lock(&self) -> Result<ClientLock> {
        let (finalizer, client) = {
            let guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
            (self.finalizer.clone(), guard.clone())
        };
        let finalizer = finalizer.upgrade().ok_or(FsError::SubsystemFinalized)?;
        let guard = finalizer.state.clone().read_owned().await;
        if guard.finalized {
            return Err(FsError::SubsystemFinalized);
        }
        let client = client.ok_or(FsError::SubsystemFinalized)?;
        Ok(ClientLock { _guard: guard, client })
    }

    fn finalize(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(client);
    }
}

/// Shared-mode access to a client for the duration of one request.
pub struct ClientLock {
    _guard: OwnedRwLockReadGuard<FinalizerState>,
    client: Arc<dyn ObjectClient>,
}

impl Deref for ClientLock {
    type Target = dyn ObjectClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for ClientLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLock").field("client", &self.client).finish()
    }
}
