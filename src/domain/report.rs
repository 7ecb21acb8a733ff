use crate::domain::{Batch, BatchStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub avg_utilization: f64,
    pub p95_utilization: f64,
    pub p99_utilization: f64,
    pub max_utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamStats {
    pub avg_usage_mb: f64,
    pub p95_usage_mb: f64,
    pub p99_usage_mb: f64,
    pub max_usage_mb: f64,
}

/// Read-model projection of a batch. Never authoritative; rebuilt from the aggregate on
/// a store miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub vehicle_id: String,
    pub vin: String,
    pub status: BatchStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub cpu_stats: Option<CpuStats>,
    pub ram_stats: Option<RamStats>,
    pub diagnosis_result: Option<String>,
    pub diagnosis_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// Snapshot of the batch as it is now. Statistics are filled in by the aggregation
    /// and diagnosis workers, not here.
    pub fn from_batch(batch: &Batch) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            vehicle_id: batch.vehicle_id.clone(),
            vin: batch.vin.clone(),
            status: batch.status,
            total_files: batch.total_files,
            processed_files: batch.processed_files,
            cpu_stats: None,
            ram_stats: None,
            diagnosis_result: None,
            diagnosis_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Live progress view of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub progress_percent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    pub fn new(batch: &Batch, processed_files: u32) -> Self {
        let processed_files = processed_files.min(batch.total_files);
        let progress_percent = if batch.total_files == 0 {
            0.0
        } else {
            f64::from(processed_files) / f64::from(batch.total_files) * 100.0
        };

        Self {
            batch_id: batch.id,
            status: batch.status,
            total_files: batch.total_files,
            processed_files,
            progress_percent,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
            completed_at: batch.completed_at,
        }
    }
}
