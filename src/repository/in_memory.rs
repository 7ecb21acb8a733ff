//! In-process repositories for tests and local runs.
//!
//! Each repository is a cheap `Clone` over shared maps, so a test can keep a handle to
//! inspect what the engine persisted. Reads and writes are counted, and a repository can
//! be switched to fail every call with a transient error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{is_stuck, BatchRepository, FileRepository, ReportRepository};
use crate::domain::{Batch, BatchStatus, FileRecord, ProcessingStatus, Report};
use crate::error::{ArgusError, ArgusResult};

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct Health {
    counters: Arc<Counters>,
    failing: Arc<AtomicBool>,
    read_delay_ms: Arc<AtomicU64>,
    write_delay_ms: Arc<AtomicU64>,
}

impl Health {
    fn check(&self, operation: &str) -> ArgusResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ArgusError::Database(format!(
                "injected failure during {operation}"
            )));
        }
        Ok(())
    }

    async fn read(&self, operation: &str) -> ArgusResult<()> {
        self.check(operation)?;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.read_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }

    async fn write(&self, operation: &str) -> ArgusResult<()> {
        self.check(operation)?;
        let delay_ms = self.write_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

macro_rules! inspection_hooks {
    ($repo:ty) => {
        impl $repo {
            /// Successful read calls so far
            pub fn read_count(&self) -> u64 {
                self.health.counters.reads.load(Ordering::SeqCst)
            }

            /// Successful write calls so far
            pub fn write_count(&self) -> u64 {
                self.health.counters.writes.load(Ordering::SeqCst)
            }

            /// Make every subsequent call fail (or succeed again)
            pub fn set_failing(&self, failing: bool) {
                self.health.failing.store(failing, Ordering::SeqCst);
            }

            /// Simulated latency for reads
            pub fn set_read_delay(&self, delay: Duration) {
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                self.health.read_delay_ms.store(millis, Ordering::SeqCst);
            }

            /// Simulated latency for writes, applied before the write lands
            pub fn set_write_delay(&self, delay: Duration) {
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                self.health.write_delay_ms.store(millis, Ordering::SeqCst);
            }
        }
    };
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBatchRepository {
    batches: Arc<DashMap<Uuid, Batch>>,
    health: Health,
}

impl InMemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored copy without touching the counters
    pub fn snapshot(&self, id: Uuid) -> Option<Batch> {
        self.batches.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

inspection_hooks!(InMemoryBatchRepository);

#[async_trait]
impl BatchRepository for InMemoryBatchRepository {
    async fn save(&self, batch: &Batch) -> ArgusResult<()> {
        self.health.write("batch save").await?;
        self.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<Batch>> {
        self.health.read("batch find_by_id").await?;
        Ok(self.snapshot(id))
    }

    async fn find_by_status(&self, status: BatchStatus) -> ArgusResult<Vec<Batch>> {
        self.health.read("batch find_by_status").await?;
        let mut found: Vec<Batch> = self
            .batches
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|batch| batch.created_at);
        Ok(found)
    }

    async fn find_stuck_batches(
        &self,
        now: DateTime<Utc>,
        scattering_threshold: Duration,
        diagnosing_timeout: Duration,
    ) -> ArgusResult<Vec<Batch>> {
        self.health.read("batch find_stuck_batches").await?;
        let mut found: Vec<Batch> = self
            .batches
            .iter()
            .filter(|entry| is_stuck(entry.value(), now, scattering_threshold, diagnosing_timeout))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|batch| batch.updated_at);
        Ok(found)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryFileRepository {
    files: Arc<DashMap<Uuid, FileRecord>>,
    health: Health,
}

impl InMemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

inspection_hooks!(InMemoryFileRepository);

#[async_trait]
impl FileRepository for InMemoryFileRepository {
    async fn save(&self, file: &FileRecord) -> ArgusResult<()> {
        self.health.write("file save").await?;
        self.files.insert(file.id, file.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<FileRecord>> {
        self.health.read("file find_by_id").await?;
        Ok(self.files.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Vec<FileRecord>> {
        self.health.read("file find_by_batch_id").await?;
        let mut found: Vec<FileRecord> = self
            .files
            .iter()
            .filter(|entry| entry.batch_id == batch_id)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|file| file.created_at);
        Ok(found)
    }

    async fn update_processing_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
    ) -> ArgusResult<()> {
        self.health.write("file update_processing_status").await?;
        let mut entry = self
            .files
            .get_mut(&id)
            .ok_or_else(|| ArgusError::invalid_state(format!("file {id} not found")))?;
        entry.transition_to(status)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryReportRepository {
    reports: Arc<DashMap<Uuid, Report>>,
    health: Health,
}

impl InMemoryReportRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

inspection_hooks!(InMemoryReportRepository);

#[async_trait]
impl ReportRepository for InMemoryReportRepository {
    async fn save(&self, report: &Report) -> ArgusResult<()> {
        self.health.write("report save").await?;
        self.reports.insert(report.batch_id, report.clone());
        Ok(())
    }

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Option<Report>> {
        self.health.read("report find_by_batch_id").await?;
        Ok(self.reports.get(&batch_id).map(|entry| entry.value().clone()))
    }
}
