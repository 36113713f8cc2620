// ENFORCEMENT: IP Block Registry - Time-Bounded Block List
//
// First gate of the request pipeline. Blocks are stored as TTL'd entries in the shared
// store, so expiry needs no per-entry timer: Redis expires them natively, and the local
// store expires them lazily on lookup plus a periodic sweep. In local mode each worker has
// its own block list, so a blocked client may still reach a different worker.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::max_duration;
use crate::error::Result;
use crate::store::SharedBackend;

const BLOCK_KEY_PREFIX: &str = "block:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct IpBlockRegistry {
    backend: Arc<SharedBackend>,
    default_duration: Duration,
}

impl IpBlockRegistry {
    pub fn new(backend: Arc<SharedBackend>, default_duration: Duration) -> Self {
        Self {
            backend,
            default_duration,
        }
    }

    fn key(ip: &str) -> String {
        format!("{}{}", BLOCK_KEY_PREFIX, ip)
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Block `ip` for `duration` (or the default), capped at the maximum lifetime.
    /// Re-blocking replaces the entry, which is a single atomic write, never a
    /// check-then-delete.
    pub async fn block(&self, ip: &str, reason: &str, duration: Option<Duration>) -> Result<BlockedEntry> {
        let duration = duration.unwrap_or(self.default_duration).min(max_duration());
        let blocked_at = Utc::now();
        let expires_at = blocked_at
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::hours(1));

        let entry = BlockedEntry {
            ip: ip.to_string(),
            reason: reason.to_string(),
            blocked_at,
            expires_at,
        };

        let payload = serde_json::to_string(&entry)?;
        self.backend.set_with_ttl(&Self::key(ip), &payload, duration).await?;

        warn!(
            ip = %ip,
            reason = %reason,
            duration_secs = duration.as_secs(),
            "IP blocked"
        );
        Ok(entry)
    }

    pub async fn is_blocked(&self, ip: &str) -> Result<bool> {
        Ok(self.backend.get(&Self::key(ip)).await?.is_some())
    }

    pub async fn lookup(&self, ip: &str) -> Result<Option<BlockedEntry>> {
        match self.backend.get(&Self::key(ip)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn unblock(&self, ip: &str) -> Result<bool> {
        let removed = self.backend.remove(&Self::key(ip)).await?;
        if removed {
            info!(ip = %ip, "IP unblocked");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IpBlockRegistry {
        IpBlockRegistry::new(Arc::new(SharedBackend::local_only()), Duration::from_secs(3600))
    }

    #[tokio::test(start_paused = true)]
    async fn block_is_visible_immediately_and_expires_on_its_own() {
        let registry = registry();
        assert!(!registry.is_blocked("203.0.113.7").await.unwrap());

        registry
            .block("203.0.113.7", "path_traversal", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(registry.is_blocked("203.0.113.7").await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!registry.is_blocked("203.0.113.7").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn default_duration_is_applied() {
        let registry = registry();
        let entry = registry.block("198.51.100.1", "attack_pattern", None).await.unwrap();
        assert_eq!((entry.expires_at - entry.blocked_at).num_seconds(), 3600);

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(registry.is_blocked("198.51.100.1").await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!registry.is_blocked("198.51.100.1").await.unwrap());
    }

    #[tokio::test]
    async fn lookup_and_unblock() {
        let registry = registry();
        registry.block("192.0.2.9", "request_flood", None).await.unwrap();

        let entry = registry.lookup("192.0.2.9").await.unwrap().expect("entry");
        assert_eq!(entry.reason, "request_flood");

        assert!(registry.unblock("192.0.2.9").await.unwrap());
        assert!(!registry.is_blocked("192.0.2.9").await.unwrap());
        assert!(!registry.unblock("192.0.2.9").await.unwrap());
    }

    #[tokio::test]
    async fn block_duration_is_capped() {
        let registry = registry();
        let entry = registry
            .block("203.0.113.8", "manual", Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        let lifetime = (entry.expires_at - entry.blocked_at).num_seconds() as u64;
        assert_eq!(lifetime, max_duration().as_secs());
        assert!(registry.is_blocked("203.0.113.8").await.unwrap());
    }
}
