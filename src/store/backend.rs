use std::{sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BucketLimits, BucketState, LocalStore, RedisStore, SharedStore, StoreKind};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

// COORDINATOR: SharedBackend - Swappable Store Slot
// Starts on the local store. A background reconnect task promotes the remote store once it is
// reachable; any remote failure degrades back to local. Callers clone the active Arc
// before each operation, so a swap never leaves a request half on one store and half on
// the other.
//
// FLAGS (blocks, revocations):
// - Every write lands in the local store first, then in the remote store. A worker that
//   degrades keeps honoring the flags it wrote itself.
// - Promotion copies every live local flag, with its remaining lifetime, to the remote
//   store before the swap. Flags written before the remote store was reachable (or while
//   degraded) stay in force afterwards.
// - A failed remote lookup is an error, never a silent local read. The caller rejects.
// - Flag writes hold the slot's read guard across the remote call, so promotion (which
//   takes the write guard) cannot interleave with them.
#[derive(Debug)]
pub struct SharedBackend {
    local: Arc<LocalStore>,
    active: RwLock<Arc<dyn SharedStore>>,
}

impl SharedBackend {
    pub fn local_only() -> Self {
        let local = Arc::new(LocalStore::new());
        Self {
            active: RwLock::new(local.clone() as Arc<dyn SharedStore>),
            local,
        }
    }

    pub async fn active(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&*self.active.read().await)
    }

    pub fn local(&self) -> Arc<LocalStore> {
        Arc::clone(&self.local)
    }

    pub async fn kind(&self) -> StoreKind {
        self.active.read().await.kind()
    }

    pub async fn is_remote(&self) -> bool {
        self.kind().await != StoreKind::Local
    }

    /// Swap in a remote store after carrying live local flags over to it. On a copy
    /// failure the backend stays local and the error is returned.
    pub async fn promote(&self, remote: Arc<dyn SharedStore>) -> Result<()> {
        let mut active = self.active.write().await;

        let flags = self.local.live_flags();
        for (key, value, ttl) in &flags {
            remote.set_with_ttl(key, value, *ttl).await?;
        }

        let previous = active.kind();
        *active = remote;
        if previous == StoreKind::Local {
            info!(
                backend = ?active.kind(),
                carried_flags = flags.len(),
                "Shared store promoted, state is now shared across workers"
            );
        }
        Ok(())
    }

    /// Fall back to the local store. Returns true if this call performed the transition.
    pub async fn degrade(&self, reason: &str) -> bool {
        let mut active = self.active.write().await;
        if active.kind() == StoreKind::Local {
            return false;
        }
        *active = self.local.clone() as Arc<dyn SharedStore>;
        warn!(
            reason = %reason,
            "Shared store unavailable, degrading to per-process local store"
        );
        true
    }

    /// Consume against the active store. A remote failure degrades the backend and is
    /// returned to the caller, which owns the fail-open/fail-closed decision.
    pub async fn consume(&self, key: &str, limits: BucketLimits) -> Result<BucketState> {
        let store = self.active().await;
        match store.consume(key, limits).await {
            Err(e) if store.kind() != StoreKind::Local => {
                self.degrade(&e.to_string()).await;
                Err(Error::BackendUnavailable(e.to_string()))
            }
            other => other,
        }
    }

    /// Write a flag locally, then remotely. A remote failure degrades the backend; the
    /// flag still holds on this worker.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.local.set_with_ttl(key, value, ttl).await?;

        let failure = {
            let active = self.active.read().await;
            if active.kind() == StoreKind::Local {
                return Ok(());
            }
            active.set_with_ttl(key, value, ttl).await.err()
        };
        if let Some(e) = failure {
            self.degrade(&e.to_string()).await;
        }
        Ok(())
    }

    /// Read a flag from the active store. A remote failure degrades the backend and is
    /// returned as `BackendUnavailable`.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.active().await;
        if store.kind() == StoreKind::Local {
            return self.local.get(key).await;
        }
        match store.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.degrade(&e.to_string()).await;
                Err(Error::BackendUnavailable(e.to_string()))
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let removed_local = self.local.remove(key).await?;

        let remote = {
            let active = self.active.read().await;
            if active.kind() == StoreKind::Local {
                return Ok(removed_local);
            }
            active.remove(key).await
        };
        match remote {
            Ok(removed) => Ok(removed || removed_local),
            Err(e) => {
                self.degrade(&e.to_string()).await;
                Ok(removed_local)
            }
        }
    }

    /// Clear remote keys under `prefix` first, then local state.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let store = self.active().await;
        let mut removed = 0;
        if store.kind() != StoreKind::Local {
            match store.clear_prefix(prefix).await {
                Ok(count) => removed += count,
                Err(e) => {
                    self.degrade(&e.to_string()).await;
                }
            }
        }
        removed += self.local.clear_prefix(prefix).await?;
        Ok(removed)
    }

    /// One connection attempt. Returns true when the remote store is now active.
    pub async fn connect_remote(&self, url: &str, timeout: Duration) -> bool {
        if self.is_remote().await {
            return true;
        }
        let remote = match RedisStore::connect(url, timeout).await {
            Ok(remote) => remote,
            Err(e) => {
                debug!(error = %e, "Shared store still unreachable");
                return false;
            }
        };
        match self.promote(Arc::new(remote)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Shared store reachable but local flags could not be carried over");
                false
            }
        }
    }

    /// Periodically try to reach the remote store while running locally. The first
    /// attempt happens immediately, which is the asynchronous initialization step.
    pub fn start_remote_reconnect(self: &Arc<Self>, config: &StoreConfig) -> Option<tokio::task::JoinHandle<()>> {
        let url = config.redis_url.clone()?;
        let timeout = config.timeout();
        let interval = Duration::from_secs(config.reconnect_interval_secs);
        let backend = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                backend.connect_remote(&url, timeout).await;
            }
        }))
    }
}
