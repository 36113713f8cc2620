// ARCHITECTURE: Shared Store - Backing State for Quotas, Blocks and Revocations
//
// Components never talk to a concrete store. They go through `SharedBackend`, which holds
// the active `SharedStore` implementation:
// - LocalStore: per-process memory (single worker, tests, or degraded mode)
// - RedisStore: shared across workers, atomic operations via Lua and native TTLs
//
// Without a shared store every worker keeps its own buckets, blocks and revocations. A
// client blocked by one worker can still be served by another. That is an accepted
// consistency trade-off of local mode.

pub mod backend;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ScopeLimits;
use crate::error::Result;

pub use backend::SharedBackend;
pub use memory::LocalStore;
pub use redis_store::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Redis,
}

/// Limits applied to a single fixed-window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimits {
    pub points: u32,
    pub duration: Duration,
    pub block_duration: Duration,
}

impl From<ScopeLimits> for BucketLimits {
    fn from(limits: ScopeLimits) -> Self {
        Self {
            points: limits.points,
            duration: limits.duration(),
            block_duration: limits.block_duration(),
        }
    }
}

/// Outcome of one atomic consume against a bucket.
///
/// `ms_before_next` is the time until the window resets when allowed, or until the block
/// lifts when rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub allowed: bool,
    pub remaining: u32,
    pub ms_before_next: u64,
}

impl BucketState {
    pub fn allowed(remaining: u32, until_reset: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            ms_before_next: until_reset.as_millis() as u64,
        }
    }

    pub fn rejected(until_unblock: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            ms_before_next: until_unblock.as_millis() as u64,
        }
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StoreKind;

    /// Atomic check-and-decrement of a fixed-window bucket.
    async fn consume(&self, key: &str, limits: BucketLimits) -> Result<BucketState>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn remove(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`, returning the number removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}
