//! # Persistence Boundary
//!
//! CRUD traits for the batch aggregate, its files and the report read model. The saga
//! never relies on the repository for coordination: saves are full-aggregate overwrites
//! and every handler only moves state forward.
//!
//! Two implementations ship with the crate: [`postgres`] for production and
//! [`in_memory`] for tests and local runs.

pub mod in_memory;
pub mod migrations;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Batch, BatchStatus, FileRecord, ProcessingStatus, Report};
use crate::error::ArgusResult;

pub use in_memory::{InMemoryBatchRepository, InMemoryFileRepository, InMemoryReportRepository};
pub use postgres::{PgBatchRepository, PgFileRepository, PgReportRepository};

#[async_trait]
pub trait BatchRepository: Send + Sync + std::fmt::Debug {
    /// Insert or overwrite the batch, pending event log included.
    async fn save(&self, batch: &Batch) -> ArgusResult<()>;

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<Batch>>;

    async fn find_by_status(&self, status: BatchStatus) -> ArgusResult<Vec<Batch>>;

    /// Batches sitting in `scattering` longer than `scattering_threshold`, or in
    /// `diagnosing` longer than `diagnosing_timeout`, measured from `updated_at`.
    async fn find_stuck_batches(
        &self,
        now: DateTime<Utc>,
        scattering_threshold: Duration,
        diagnosing_timeout: Duration,
    ) -> ArgusResult<Vec<Batch>>;
}

#[async_trait]
pub trait FileRepository: Send + Sync + std::fmt::Debug {
    async fn save(&self, file: &FileRecord) -> ArgusResult<()>;

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<FileRecord>>;

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Vec<FileRecord>>;

    async fn update_processing_status(&self, id: Uuid, status: ProcessingStatus)
        -> ArgusResult<()>;
}

#[async_trait]
pub trait ReportRepository: Send + Sync + std::fmt::Debug {
    async fn save(&self, report: &Report) -> ArgusResult<()>;

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Option<Report>>;
}

/// `now - age`, saturating at the earliest representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Shared stuck-batch rule so both repositories agree on the boundary.
pub(crate) fn is_stuck(
    batch: &Batch,
    now: DateTime<Utc>,
    scattering_threshold: Duration,
    diagnosing_timeout: Duration,
) -> bool {
    match batch.status {
        BatchStatus::Scattering => batch.updated_at < cutoff(now, scattering_threshold),
        BatchStatus::Diagnosing => batch.updated_at < cutoff(now, diagnosing_timeout),
        _ => false,
    }
}
