use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{BucketLimits, BucketState, SharedStore, StoreKind};
use crate::config::max_duration;
use crate::error::Result;

// TRACKING: QuotaBucket - Fixed Window With Block State
#[derive(Debug, Clone)]
struct QuotaBucket {
    points_remaining: u32,
    window_start: Instant,
    duration: Duration,
    block_until: Option<Instant>,
}

impl QuotaBucket {
    fn fresh(now: Instant, limits: BucketLimits) -> Self {
        Self {
            points_remaining: limits.points,
            window_start: now,
            duration: limits.duration.min(max_duration()),
            block_until: None,
        }
    }

    fn consume(&mut self, now: Instant, limits: BucketLimits) -> BucketState {
        if let Some(until) = self.block_until {
            if now < until {
                return BucketState::rejected(until - now);
            }
            *self = Self::fresh(now, limits);
        }

        if now.duration_since(self.window_start) >= self.duration {
            *self = Self::fresh(now, limits);
        }

        // Limits may have been lowered at runtime
        self.points_remaining = self.points_remaining.min(limits.points);
        self.duration = limits.duration.min(max_duration());

        if self.points_remaining == 0 {
            let block = limits.block_duration.min(max_duration());
            self.block_until = Some(now + block);
            return BucketState::rejected(block);
        }

        self.points_remaining -= 1;
        let window_end = self.window_start + self.duration;
        BucketState::allowed(self.points_remaining, window_end.saturating_duration_since(now))
    }

    fn is_stale(&self, now: Instant) -> bool {
        let window_over = now.duration_since(self.window_start) >= self.duration;
        let block_over = self.block_until.map_or(true, |until| now >= until);
        window_over && block_over
    }
}

#[derive(Debug, Clone)]
struct FlagEntry {
    value: String,
    expires_at: Instant,
}

/// Per-process store. Each DashMap shard lock serializes access to the keys it holds, so
/// consume is an atomic check-and-decrement within the process.
#[derive(Debug, Default)]
pub struct LocalStore {
    buckets: DashMap<String, QuotaBucket>,
    flags: DashMap<String, FlagEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired flags and idle buckets. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len() + self.flags.len();

        self.buckets.retain(|_, bucket| !bucket.is_stale(now));
        self.flags.retain(|_, entry| entry.expires_at > now);

        before.saturating_sub(self.buckets.len() + self.flags.len())
    }

    /// One periodic sweeper replaces per-entry timers.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired local store entries");
                }
            }
        })
    }

    /// Unexpired flags with their remaining lifetime, used to carry local state over to a
    /// newly reachable remote store.
    pub fn live_flags(&self) -> Vec<(String, String, Duration)> {
        let now = Instant::now();
        self.flags
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| (entry.key().clone(), entry.value.clone(), entry.expires_at - now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.len() + self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn consume(&self, key: &str, limits: BucketLimits) -> Result<BucketState> {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| QuotaBucket::fresh(now, limits));
        Ok(bucket.consume(now, limits))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.flags.insert(
            key.to_string(),
            FlagEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl.min(max_duration()),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.flags.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Conditional removal so a concurrent re-insert is never lost
            self.flags.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let removed_bucket = self.buckets.remove(key).is_some();
        let removed_flag = self
            .flags
            .remove(key)
            .map_or(false, |(_, entry)| entry.expires_at > now);
        Ok(removed_bucket || removed_flag)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.len();
        self.buckets.retain(|key, _| !key.starts_with(prefix));
        self.flags.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
