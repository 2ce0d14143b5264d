use crate::error::{AppError, Result};
use crate::idempotency::serializer::StoredValue;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared key-value store the engine coordinates through.
///
/// `create_if_absent` must be atomic across every process sharing the store;
/// it is the only primitive the at-most-once guarantee rests on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Writes `value` only if `key` is absent. Returns true iff this call created it.
    async fn create_if_absent(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<bool>;

    async fn read(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Unconditional set. Only the claim's winner calls this.
    async fn overwrite(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Connectivity check for health checks.
    async fn ping(&self) -> Result<()>;
}

fn ttl_millis(ttl: Duration) -> usize {
    ttl.as_millis().clamp(1, usize::MAX as u128) as usize
}

/// Redis-backed store using `SET NX PX` for claims.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn create_if_absent(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        let result: Option<String> = conn
            .set_options(
                self.make_key(key),
                value.as_str(),
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl_millis(ttl))),
            )
            .await
            .map_err(AppError::Redis)?;

        Ok(result.is_some())
    }

    async fn read(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.make_key(key)).await.map_err(AppError::Redis)?;

        Ok(value.map(StoredValue::new))
    }

    async fn overwrite(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;

        let _: Option<String> = conn
            .set_options(
                self.make_key(key),
                value.as_str(),
                redis::SetOptions::default().with_expiration(redis::SetExpiry::PX(ttl_millis(ttl))),
            )
            .await
            .map_err(AppError::Redis)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(self.make_key(key)).await.map_err(AppError::Redis)?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::Redis)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: StoredValue,
    expires_at: Instant,
}

/// Map size from which inserts start sweeping expired entries.
const SWEEP_THRESHOLD: usize = 1024;

/// Process-local store with the same semantics as the Redis store.
///
/// Expiry follows `tokio::time`, so tests can drive it with a paused clock.
/// Expired entries are dropped when read, and all of them are swept whenever
/// the map grows to a power of two from 1024 entries on, which keeps it
/// within about twice the live entries. [`purge_expired`](Self::purge_expired)
/// sweeps on demand.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|entry| entry.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn create_if_absent(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        if entries.len() >= SWEEP_THRESHOLD && entries.len().is_power_of_two() {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn read(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn overwrite(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
