use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::info;

use super::{BucketLimits, BucketState, SharedStore, StoreKind};
use crate::error::{Error, Result};

// Fixed window with block state in one round trip. The block key outlives the bucket key,
// so once it expires the next consume starts a fresh window.
const CONSUME_SCRIPT: &str = r#"
local bucket_key = KEYS[1]
local block_key = KEYS[2]
local points = tonumber(ARGV[1])
local duration_ms = tonumber(ARGV[2])
local block_ms = tonumber(ARGV[3])

local block_ttl = redis.call('PTTL', block_key)
if block_ttl > 0 then
  return {0, 0, block_ttl}
end

local consumed = redis.call('INCR', bucket_key)
if consumed == 1 then
  redis.call('PEXPIRE', bucket_key, duration_ms)
end

if consumed > points then
  redis.call('SET', block_key, '1', 'PX', block_ms)
  redis.call('DEL', bucket_key)
  return {0, 0, block_ms}
end

local ttl = redis.call('PTTL', bucket_key)
if ttl < 0 then
  ttl = duration_ms
end
return {1, points - consumed, ttl}
"#;

const SCAN_BATCH: usize = 500;

/// Store shared by every worker. All calls are bounded by `timeout`.
pub struct RedisStore {
    connection: ConnectionManager,
    consume_script: Script,
    timeout: Duration,
    url: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                Error::BackendUnavailable(format!(
                    "connecting to store timed out after {}ms",
                    timeout.as_millis()
                ))
            })??;

        let store = Self {
            connection,
            consume_script: Script::new(CONSUME_SCRIPT),
            timeout,
            url: url.to_string(),
        };
        store.ping().await?;

        info!(timeout_ms = timeout.as_millis() as u64, "Connected to shared store");
        Ok(store)
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::BackendUnavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.timeout.as_millis()
            ))),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }

    async fn consume(&self, key: &str, limits: BucketLimits) -> Result<BucketState> {
        let mut conn = self.connection.clone();
        let block_key = format!("{}:blocked", key);

        let mut invocation = self.consume_script.prepare_invoke();
        invocation
            .key(key)
            .key(&block_key)
            .arg(limits.points)
            .arg(millis(limits.duration))
            .arg(millis(limits.block_duration));

        let (allowed, remaining, ms): (i64, i64, i64) = self
            .bounded("consume", invocation.invoke_async(&mut conn))
            .await?;

        let ms = Duration::from_millis(ms.max(0) as u64);
        Ok(if allowed == 1 {
            BucketState::allowed(remaining.max(0) as u32, ms)
        } else {
            BucketState::rejected(ms)
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded(
            "set",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        self.bounded("get", conn.get::<_, Option<String>>(key)).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self.bounded("del", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = self.bounded("del", conn.del(keys)).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance and are ignored by default

    #[tokio::test]
    #[ignore]
    async fn redis_consume_blocks_after_exhaustion() {
        let store = RedisStore::connect("redis://127.0.0.1/", Duration::from_millis(500))
            .await
            .expect("connect");
        store.clear_prefix("test:rl:").await.expect("clear");

        let limits = BucketLimits {
            points: 2,
            duration: Duration::from_secs(60),
            block_duration: Duration::from_secs(10),
        };

        assert!(store.consume("test:rl:ip:a", limits).await.unwrap().allowed);
        assert!(store.consume("test:rl:ip:a", limits).await.unwrap().allowed);
        let rejected = store.consume("test:rl:ip:a", limits).await.unwrap();
        assert!(!rejected.allowed);
        assert!(rejected.ms_before_next > 9_000);
    }

    #[tokio::test]
    #[ignore]
    async fn redis_flags_round_trip() {
        let store = RedisStore::connect("redis://127.0.0.1/", Duration::from_millis(500))
            .await
            .expect("connect");

        store
            .set_with_ttl("test:block:1.2.3.4", "payload", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.get("test:block:1.2.3.4").await.unwrap().as_deref(),
            Some("payload")
        );
        assert!(store.remove("test:block:1.2.3.4").await.unwrap());
    }
}
