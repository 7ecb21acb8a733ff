//! # In-Memory Shared Store
//!
//! Process-local stand-in for Redis used by tests and single-node development.
//!
//! ## Features
//!
//! - **Per-key atomicity**: every operation runs under the `DashMap` shard lock for its key
//! - **Lazy expiry**: expired entries are treated as absent and purged on access
//! - **Inspection hooks**: operation counters and an availability switch for failure tests

use super::{SharedStoreService, StoreError, StoreResult};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    gets: AtomicU64,
    sets: AtomicU64,
    set_adds: AtomicU64,
    deletes: AtomicU64,
}

/// Snapshot of how often each operation was called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreOpCounts {
    pub gets: u64,
    pub sets: u64,
    pub set_adds: u64,
    pub deletes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySharedStore {
    entries: Arc<DashMap<String, StoredEntry>>,
    counters: Arc<StoreCounters>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn op_counts(&self) -> StoreOpCounts {
        StoreOpCounts {
            gets: self.counters.gets.load(Ordering::SeqCst),
            sets: self.counters.sets.load(Ordering::SeqCst),
            set_adds: self.counters.set_adds.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    /// Whether `key` currently exists (ignoring expired entries).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Remaining time-to-live of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Backend(format!(
            "WRONGTYPE operation against key {key} holding the wrong kind of value"
        ))
    }
}

impl SharedStoreService for InMemorySharedStore {
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        self.counters.set_adds.fetch_add(1, Ordering::SeqCst);
        self.purge_if_expired(key);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::Set(HashSet::new()),
                expires_at: None,
            });
        match &mut entry.value {
            StoredValue::Set(members) => Ok(members.insert(member.to_string())),
            StoredValue::Text(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_cardinality(&self, key: &str) -> StoreResult<u64> {
        self.check_available()?;
        self.purge_if_expired(key);

        match self.entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                StoredValue::Set(members) => Ok(members.len() as u64),
                StoredValue::Text(_) => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        self.purge_if_expired(key);

        match self.entries.get_mut(key) {
            None => Ok(false),
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.purge_if_expired(key);

        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                StoredValue::Text(value) => Ok(Some(value.clone())),
                StoredValue::Set(_) => Err(Self::wrong_type(key)),
            },
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.counters.sets.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
