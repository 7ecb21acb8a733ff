//! # Shared Fast Store
//!
//! The key-value store shared by every orchestrator instance. It backs two things:
//! the per-batch completion barrier (set operations) and the report cache (string values
//! with a TTL).
//!
//! Uses enum dispatch (like the bus provider) so callers hold one concrete
//! [`SharedStoreProvider`] regardless of backend. Every operation is a single atomic
//! primitive on the backend; no multi-step locking is done here.

pub mod in_memory;
pub mod redis;

pub use self::in_memory::InMemorySharedStore;
pub use self::redis::RedisSharedStore;

use crate::config::RedisConfig;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the orchestration core needs from the shared store.
pub trait SharedStoreService: Send + Sync {
    /// Add `member` to the set at `key`. Returns `true` when it was not already present.
    fn set_add(
        &self,
        key: &str,
        member: &str,
    ) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    /// Number of members in the set at `key`; zero when the key does not exist.
    fn set_cardinality(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = StoreResult<u64>> + Send;

    /// Set a time-to-live on `key`. Returns `false` when the key does not exist.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = StoreResult<()>> + Send;

    /// `Ok(None)` on a miss; misses are not errors.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = StoreResult<Option<String>>> + Send;

    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = StoreResult<()>> + Send;

    fn health_check(&self) -> impl std::future::Future<Output = StoreResult<bool>> + Send;

    fn provider_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub enum SharedStoreProvider {
    Redis(Box<RedisSharedStore>),
    InMemory(InMemorySharedStore),
}

impl SharedStoreProvider {
    pub async fn connect_redis(config: &RedisConfig) -> StoreResult<Self> {
        Ok(Self::Redis(Box::new(
            RedisSharedStore::from_config(config).await?,
        )))
    }

    pub fn new_in_memory() -> Self {
        Self::InMemory(InMemorySharedStore::new())
    }

    /// The in-memory backend, for tests that inspect store state.
    pub fn as_in_memory(&self) -> Option<&InMemorySharedStore> {
        match self {
            Self::InMemory(s) => Some(s),
            Self::Redis(_) => None,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(s) => s.provider_name(),
            Self::InMemory(s) => s.provider_name(),
        }
    }

    pub async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.set_add(key, member).await,
            Self::InMemory(s) => s.set_add(key, member).await,
        }
    }

    pub async fn set_cardinality(&self, key: &str) -> StoreResult<u64> {
        match self {
            Self::Redis(s) => s.set_cardinality(key).await,
            Self::InMemory(s) => s.set_cardinality(key).await,
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.expire(key, ttl).await,
            Self::InMemory(s) => s.expire(key, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        match self {
            Self::Redis(s) => s.delete(key).await,
            Self::InMemory(s) => s.delete(key).await,
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self {
            Self::Redis(s) => s.get(key).await,
            Self::InMemory(s) => s.get(key).await,
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        match self {
            Self::Redis(s) => s.set_with_ttl(key, value, ttl).await,
            Self::InMemory(s) => s.set_with_ttl(key, value, ttl).await,
        }
    }

    pub async fn health_check(&self) -> StoreResult<bool> {
        match self {
            Self::Redis(s) => s.health_check().await,
            Self::InMemory(s) => s.health_check().await,
        }
    }
}
