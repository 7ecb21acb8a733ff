//! # Distributed Completion Barrier
//!
//! Lets many worker instances report "file X of batch B is done" concurrently and lets
//! callers observe when every expected file has reported, without a central lock.
//!
//! ## Design
//!
//! One shared set per batch (`batch:{id}:processed_files`) holds the file ids reported so
//! far. Insertion is idempotent, so duplicate deliveries never inflate the count. The
//! insertion result only decides whether to set the expiry; completion is decided by
//! comparing the set cardinality to the batch's persisted `total_files`, which the caller
//! must re-read because it can still grow while uploads and parsing overlap.
//!
//! Several consumers may observe "complete" for the same batch. Whatever they trigger
//! must be idempotent on its own; the barrier does not elect a single winner.

use crate::error::ArgusResult;
use crate::store::SharedStoreProvider;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Safety-net expiry for sets whose batch never completes.
pub const DEFAULT_BARRIER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of recording one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierObservation {
    /// `false` when this file had already reported.
    pub newly_added: bool,
    /// Distinct files reported so far.
    pub count: u64,
}

impl BarrierObservation {
    pub fn is_complete(&self, total_files: u32) -> bool {
        is_complete(self.count, total_files)
    }
}

/// A batch with no files is never complete through the barrier.
pub fn is_complete(count: u64, total_files: u32) -> bool {
    total_files > 0 && count >= u64::from(total_files)
}

#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    store: SharedStoreProvider,
    ttl: Duration,
}

impl CompletionBarrier {
    pub fn new(store: SharedStoreProvider, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(batch_id: Uuid) -> String {
        format!("batch:{batch_id}:processed_files")
    }

    /// Record that `file_id` finished and return the resulting count.
    pub async fn record(&self, batch_id: Uuid, file_id: Uuid) -> ArgusResult<BarrierObservation> {
        let key = Self::key(batch_id);
        let newly_added = self.store.set_add(&key, &file_id.to_string()).await?;

        if newly_added {
            self.store.expire(&key, self.ttl).await?;
        }

        let count = self.store.set_cardinality(&key).await?;
        debug!(
            batch_id = %batch_id,
            file_id = %file_id,
            newly_added = newly_added,
            count = count,
            "Barrier completion recorded"
        );

        Ok(BarrierObservation { newly_added, count })
    }

    /// Current count without recording anything.
    pub async fn count(&self, batch_id: Uuid) -> ArgusResult<u64> {
        Ok(self.store.set_cardinality(&Self::key(batch_id)).await?)
    }

    /// Drop the set once the batch has moved past the barrier.
    pub async fn release(&self, batch_id: Uuid) -> ArgusResult<()> {
        self.store.delete(&Self::key(batch_id)).await?;
        debug!(batch_id = %batch_id, "Barrier released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn barrier() -> (CompletionBarrier, SharedStoreProvider) {
        let store = SharedStoreProvider::new_in_memory();
        (
            CompletionBarrier::new(store.clone(), DEFAULT_BARRIER_TTL),
            store,
        )
    }

    #[tokio::test]
    async fn test_duplicate_report_does_not_change_count() {
        let (barrier, _) = barrier();
        let batch_id = Uuid::new_v4();
        let file_id = Uuid::new_v4();

        let first = barrier.record(batch_id, file_id).await.unwrap();
        let second = barrier.record(batch_id, file_id).await.unwrap();

        assert_eq!(
            first,
            BarrierObservation {
                newly_added: true,
                count: 1
            }
        );
        assert_eq!(
            second,
            BarrierObservation {
                newly_added: false,
                count: 1
            }
        );
    }

    #[tokio::test]
    async fn test_expiry_set_on_first_insert() {
        let (barrier, store) = barrier();
        let batch_id = Uuid::new_v4();
        barrier.record(batch_id, Uuid::new_v4()).await.unwrap();

        let memory = store.as_in_memory().unwrap();
        let ttl = memory.ttl(&CompletionBarrier::key(batch_id)).unwrap();
        assert!(ttl > Duration::from_secs(23 * 60 * 60));
    }

    #[tokio::test]
    async fn test_release_removes_set() {
        let (barrier, store) = barrier();
        let batch_id = Uuid::new_v4();
        barrier.record(batch_id, Uuid::new_v4()).await.unwrap();
        barrier.release(batch_id).await.unwrap();

        assert_eq!(barrier.count(batch_id).await.unwrap(), 0);
        assert!(!store
            .as_in_memory()
            .unwrap()
            .contains_key(&CompletionBarrier::key(batch_id)));
    }

    #[tokio::test]
    async fn test_concurrent_reports_count_each_file_once() {
        let (barrier, _) = barrier();
        let barrier = Arc::new(barrier);
        let batch_id = Uuid::new_v4();
        let files: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for _ in 0..3 {
            for file_id in &files {
                let barrier = Arc::clone(&barrier);
                let file_id = *file_id;
                handles.push(tokio::spawn(async move {
                    barrier.record(batch_id, file_id).await.unwrap()
                }));
            }
        }

        let mut newly_added = 0;
        for handle in handles {
            if handle.await.unwrap().newly_added {
                newly_added += 1;
            }
        }

        assert_eq!(newly_added, 20);
        assert_eq!(barrier.count(batch_id).await.unwrap(), 20);
    }

    #[test]
    fn test_completion_rule() {
        assert!(!is_complete(0, 0));
        assert!(!is_complete(2, 3));
        assert!(is_complete(3, 3));
        assert!(is_complete(4, 3));
    }
}
