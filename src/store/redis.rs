//! Redis shared store
//!
//! Uses `redis::aio::ConnectionManager` for async multiplexed connections with automatic
//! reconnection. Each method issues exactly one command so atomicity is the server's.

use super::{SharedStoreService, StoreError, StoreResult};
use crate::config::RedisConfig;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct RedisSharedStore {
    connection_manager: redis::aio::ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedStore")
            .field("connection_manager", &"ConnectionManager")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisSharedStore {
    pub async fn from_config(config: &RedisConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            StoreError::Connection(format!("Failed to create Redis client: {}", e))
        })?;

        let connection_manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        debug!(url = %redact_url(&config.url), "Redis shared store connected");

        Ok(Self {
            connection_manager,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
        })
    }

    async fn run<T: redis::FromRedisValue + Send>(
        &self,
        name: &'static str,
        cmd: redis::Cmd,
    ) -> StoreResult<T> {
        let mut conn = self.connection_manager.clone();
        match tokio::time::timeout(self.command_timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(result) => result.map_err(|e| map_redis_error(name, e)),
            Err(_) => Err(StoreError::Timeout(format!(
                "Redis {} exceeded {:?}",
                name, self.command_timeout
            ))),
        }
    }
}

fn map_redis_error(name: &str, error: redis::RedisError) -> StoreError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        StoreError::Connection(format!("Redis {} failed: {}", name, error))
    } else if error.is_timeout() {
        StoreError::Timeout(format!("Redis {} timed out: {}", name, error))
    } else {
        StoreError::Backend(format!("Redis {} failed: {}", name, error))
    }
}

impl SharedStoreService for RedisSharedStore {
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: u64 = self.run("SADD", cmd).await?;
        Ok(added > 0)
    }

    async fn set_cardinality(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        self.run("SCARD", cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl.as_secs().max(1));
        let applied: u64 = self.run("EXPIRE", cmd).await?;
        Ok(applied == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run::<()>("DEL", cmd).await?;
        debug!(key = key, "Store DEL");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let result: Option<String> = self.run("GET", cmd).await?;

        if result.is_some() {
            debug!(key = key, "Cache HIT");
        } else {
            debug!(key = key, "Cache MISS");
        }
        Ok(result)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let ttl_seconds = ttl.as_secs().max(1);
        let mut cmd = redis::cmd("SETEX");
        cmd.arg(key).arg(ttl_seconds).arg(value);
        self.run::<()>("SETEX", cmd).await?;

        debug!(key = key, ttl_seconds = ttl_seconds, "Cache SET");
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let pong: String = self.run("PING", redis::cmd("PING")).await?;
        Ok(pong == "PONG")
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

/// Redact credentials from a Redis URL for logging
pub(crate) fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let prefix = &url[..=colon_pos];
            let suffix = &url[at_pos..];
            return format!("{}***{}", prefix, suffix);
        }
    }
    url.to_string()
}
