#![allow(dead_code)]

use async_trait::async_trait;
use idempotency_engine::error::{AppError, Result};
use idempotency_engine::idempotency::{
    CachePolicy, EngineConfig, IdempotencyEngine, IdempotencyKey, IdempotencyStore,
    InMemoryIdempotencyStore, StoredValue,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey::new(raw).expect("valid key")
}

/// Engine over a fresh in-memory store. The store is returned for inspection.
pub fn memory_engine() -> (Arc<IdempotencyEngine>, Arc<InMemoryIdempotencyStore>) {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let engine = Arc::new(IdempotencyEngine::new(store.clone(), EngineConfig::default()));
    (engine, store)
}

/// Like [`memory_engine`], recording under a custom cache policy.
pub fn engine_with_policy(
    policy: CachePolicy,
) -> (Arc<IdempotencyEngine>, Arc<InMemoryIdempotencyStore>) {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let config = EngineConfig {
        policy,
        ..EngineConfig::default()
    };
    let engine = Arc::new(IdempotencyEngine::new(store.clone(), config));
    (engine, store)
}

pub fn flaky_engine() -> (Arc<IdempotencyEngine>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let engine = Arc::new(IdempotencyEngine::new(store.clone(), EngineConfig::default()));
    (engine, store)
}

/// Counts how many times a protected operation actually ran.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU64>);

impl CallCounter {
    pub fn hit(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory store whose operations can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryIdempotencyStore,
    down: AtomicBool,
    overwrite_fails: AtomicBool,
    delete_fails: AtomicBool,
}

impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_overwrite(&self, fail: bool) {
        self.overwrite_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.delete_fails.store(fail, Ordering::SeqCst);
    }

    pub async fn live_entries(&self) -> usize {
        self.inner.len().await
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if self.down.load(Ordering::SeqCst) || flag.load(Ordering::SeqCst) {
            return Err(AppError::Internal(anyhow::anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for FlakyStore {
    async fn create_if_absent(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<bool> {
        self.check(&self.down)?;
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn read(&self, key: &str) -> Result<Option<StoredValue>> {
        self.check(&self.down)?;
        self.inner.read(key).await
    }

    async fn overwrite(&self, key: &str, value: &StoredValue, ttl: Duration) -> Result<()> {
        self.check(&self.overwrite_fails)?;
        self.inner.overwrite(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(&self.delete_fails)?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<()> {
        self.check(&self.down)?;
        self.inner.ping().await
    }
}
