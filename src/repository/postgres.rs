//! PostgreSQL repositories over `sqlx`.
//!
//! Queries are bound at runtime so the crate builds without a live database. Each table
//! has a `FromRow` row type that is converted into the domain type, rejecting rows whose
//! text-encoded enums or counters are out of range.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{cutoff, BatchRepository, FileRepository, ReportRepository};
use crate::domain::{
    Batch, BatchStatus, CpuStats, DomainEvent, FileRecord, ProcessingStatus, RamStats, Report,
};
use crate::error::{ArgusError, ArgusResult};

const BATCH_COLUMNS: &str = "id, vehicle_id, vin, status, upload_time, total_files, \
     processed_files, expected_worker_count, completed_worker_count, storage_bucket, \
     storage_prefix, error_message, completed_at, pending_events, created_at, updated_at";

const FILE_COLUMNS: &str = "id, batch_id, filename, original_filename, file_size, file_type, \
     upload_time, storage_path, storage_etag, processing_status, parse_duration_ms, \
     record_count, error_message, created_at, updated_at";

const REPORT_COLUMNS: &str = "id, batch_id, vehicle_id, vin, status, total_files, \
     processed_files, cpu_stats, ram_stats, diagnosis_result, diagnosis_id, created_at, \
     updated_at";

fn to_db_count(field: &str, value: u32) -> ArgusResult<i32> {
    i32::try_from(value)
        .map_err(|_| ArgusError::validation(format!("{field} {value} exceeds database range")))
}

fn from_db_count(field: &str, value: i32) -> ArgusResult<u32> {
    u32::try_from(value)
        .map_err(|_| ArgusError::Database(format!("negative {field} in database row: {value}")))
}

fn parse_batch_status(raw: &str) -> ArgusResult<BatchStatus> {
    raw.parse()
        .map_err(|_| ArgusError::Database(format!("unknown batch status in database: {raw}")))
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    vehicle_id: String,
    vin: String,
    status: String,
    upload_time: DateTime<Utc>,
    total_files: i32,
    processed_files: i32,
    expected_worker_count: i32,
    completed_worker_count: i32,
    storage_bucket: String,
    storage_prefix: String,
    error_message: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    pending_events: Json<Vec<DomainEvent>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = ArgusError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: row.id,
            vehicle_id: row.vehicle_id,
            vin: row.vin,
            status: parse_batch_status(&row.status)?,
            upload_time: row.upload_time,
            total_files: from_db_count("total_files", row.total_files)?,
            processed_files: from_db_count("processed_files", row.processed_files)?,
            expected_worker_count: from_db_count(
                "expected_worker_count",
                row.expected_worker_count,
            )?,
            completed_worker_count: from_db_count(
                "completed_worker_count",
                row.completed_worker_count,
            )?,
            storage_bucket: row.storage_bucket,
            storage_prefix: row.storage_prefix,
            error_message: row.error_message,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            events: row.pending_events.0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgBatchRepository {
    pool: PgPool,
}

impl PgBatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchRepository for PgBatchRepository {
    async fn save(&self, batch: &Batch) -> ArgusResult<()> {
        let sql = format!(
            "INSERT INTO batches ({BATCH_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 total_files = EXCLUDED.total_files, \
                 processed_files = EXCLUDED.processed_files, \
                 expected_worker_count = EXCLUDED.expected_worker_count, \
                 completed_worker_count = EXCLUDED.completed_worker_count, \
                 storage_bucket = EXCLUDED.storage_bucket, \
                 storage_prefix = EXCLUDED.storage_prefix, \
                 error_message = EXCLUDED.error_message, \
                 completed_at = EXCLUDED.completed_at, \
                 pending_events = EXCLUDED.pending_events, \
                 updated_at = EXCLUDED.updated_at"
        );

        sqlx::query(&sql)
            .bind(batch.id)
            .bind(&batch.vehicle_id)
            .bind(&batch.vin)
            .bind(batch.status.as_str())
            .bind(batch.upload_time)
            .bind(to_db_count("total_files", batch.total_files)?)
            .bind(to_db_count("processed_files", batch.processed_files)?)
            .bind(to_db_count(
                "expected_worker_count",
                batch.expected_worker_count,
            )?)
            .bind(to_db_count(
                "completed_worker_count",
                batch.completed_worker_count,
            )?)
            .bind(&batch.storage_bucket)
            .bind(&batch.storage_prefix)
            .bind(&batch.error_message)
            .bind(batch.completed_at)
            .bind(Json(&batch.events))
            .bind(batch.created_at)
            .bind(batch.updated_at)
            .execute(&self.pool)
            .await?;

        debug!(
            batch_id = %batch.id,
            status = %batch.status,
            pending_events = batch.events.len(),
            "Batch saved"
        );
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1");
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn find_by_status(&self, status: BatchStatus) -> ArgusResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE status = $1 ORDER BY created_at"
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Batch::try_from)
            .collect()
    }

    async fn find_stuck_batches(
        &self,
        now: DateTime<Utc>,
        scattering_threshold: Duration,
        diagnosing_timeout: Duration,
    ) -> ArgusResult<Vec<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE (status = 'scattering' AND updated_at < $1) \
                OR (status = 'diagnosing' AND updated_at < $2) \
             ORDER BY updated_at"
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(cutoff(now, scattering_threshold))
            .bind(cutoff(now, diagnosing_timeout))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Batch::try_from)
            .collect()
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    batch_id: Uuid,
    filename: String,
    original_filename: String,
    file_size: i64,
    file_type: String,
    upload_time: DateTime<Utc>,
    storage_path: String,
    storage_etag: String,
    processing_status: String,
    parse_duration_ms: Option<i64>,
    record_count: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = ArgusError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let processing_status = row.processing_status.parse().map_err(|_| {
            ArgusError::Database(format!(
                "unknown processing status in database: {}",
                row.processing_status
            ))
        })?;

        Ok(FileRecord {
            id: row.id,
            batch_id: row.batch_id,
            filename: row.filename,
            original_filename: row.original_filename,
            file_size: row.file_size,
            file_type: row.file_type,
            upload_time: row.upload_time,
            storage_path: row.storage_path,
            storage_etag: row.storage_etag,
            processing_status,
            parse_duration_ms: row.parse_duration_ms,
            record_count: row.record_count,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgFileRepository {
    pool: PgPool,
}

impl PgFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRepository for PgFileRepository {
    async fn save(&self, file: &FileRecord) -> ArgusResult<()> {
        let sql = format!(
            "INSERT INTO files ({FILE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (id) DO UPDATE SET \
                 storage_path = EXCLUDED.storage_path, \
                 storage_etag = EXCLUDED.storage_etag, \
                 processing_status = EXCLUDED.processing_status, \
                 parse_duration_ms = EXCLUDED.parse_duration_ms, \
                 record_count = EXCLUDED.record_count, \
                 error_message = EXCLUDED.error_message, \
                 updated_at = EXCLUDED.updated_at"
        );

        sqlx::query(&sql)
            .bind(file.id)
            .bind(file.batch_id)
            .bind(&file.filename)
            .bind(&file.original_filename)
            .bind(file.file_size)
            .bind(&file.file_type)
            .bind(file.upload_time)
            .bind(&file.storage_path)
            .bind(&file.storage_etag)
            .bind(file.processing_status.as_str())
            .bind(file.parse_duration_ms)
            .bind(file.record_count)
            .bind(&file.error_message)
            .bind(file.created_at)
            .bind(file.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> ArgusResult<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = $1");
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(FileRecord::try_from)
            .transpose()
    }

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE batch_id = $1 ORDER BY created_at"
        );
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(FileRecord::try_from)
            .collect()
    }

    async fn update_processing_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
    ) -> ArgusResult<()> {
        let mut file = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| ArgusError::invalid_state(format!("file {id} not found")))?;
        let previous = file.processing_status;
        file.transition_to(status)?;

        let result = sqlx::query(
            "UPDATE files SET processing_status = $2, updated_at = $3 \
             WHERE id = $1 AND processing_status = $4",
        )
        .bind(id)
        .bind(file.processing_status.as_str())
        .bind(file.updated_at)
        .bind(previous.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ArgusError::transient(format!(
                "file {id} changed status concurrently; expected {previous}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ReportRow {
    id: Uuid,
    batch_id: Uuid,
    vehicle_id: String,
    vin: String,
    status: String,
    total_files: i32,
    processed_files: i32,
    cpu_stats: Option<Json<CpuStats>>,
    ram_stats: Option<Json<RamStats>>,
    diagnosis_result: Option<String>,
    diagnosis_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = ArgusError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(Report {
            id: row.id,
            batch_id: row.batch_id,
            vehicle_id: row.vehicle_id,
            vin: row.vin,
            status: parse_batch_status(&row.status)?,
            total_files: from_db_count("total_files", row.total_files)?,
            processed_files: from_db_count("processed_files", row.processed_files)?,
            cpu_stats: row.cpu_stats.map(|stats| stats.0),
            ram_stats: row.ram_stats.map(|stats| stats.0),
            diagnosis_result: row.diagnosis_result,
            diagnosis_id: row.diagnosis_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgReportRepository {
    pool: PgPool,
}

impl PgReportRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportRepository for PgReportRepository {
    async fn save(&self, report: &Report) -> ArgusResult<()> {
        let sql = format!(
            "INSERT INTO reports ({REPORT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (batch_id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 total_files = EXCLUDED.total_files, \
                 processed_files = EXCLUDED.processed_files, \
                 cpu_stats = EXCLUDED.cpu_stats, \
                 ram_stats = EXCLUDED.ram_stats, \
                 diagnosis_result = EXCLUDED.diagnosis_result, \
                 diagnosis_id = EXCLUDED.diagnosis_id, \
                 updated_at = EXCLUDED.updated_at"
        );

        sqlx::query(&sql)
            .bind(report.id)
            .bind(report.batch_id)
            .bind(&report.vehicle_id)
            .bind(&report.vin)
            .bind(report.status.as_str())
            .bind(to_db_count("total_files", report.total_files)?)
            .bind(to_db_count("processed_files", report.processed_files)?)
            .bind(report.cpu_stats.as_ref().map(Json))
            .bind(report.ram_stats.as_ref().map(Json))
            .bind(&report.diagnosis_result)
            .bind(report.diagnosis_id)
            .bind(report.created_at)
            .bind(report.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_batch_id(&self, batch_id: Uuid) -> ArgusResult<Option<Report>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE batch_id = $1");
        sqlx::query_as::<_, ReportRow>(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Report::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_conversions() {
        assert_eq!(to_db_count("total_files", 3).unwrap(), 3);
        assert!(matches!(
            to_db_count("total_files", u32::MAX),
            Err(ArgusError::Validation(_))
        ));
        assert_eq!(from_db_count("total_files", 7).unwrap(), 7);
        assert!(matches!(
            from_db_count("total_files", -1),
            Err(ArgusError::Database(_))
        ));
    }

    #[test]
    fn test_batch_row_conversion_keeps_pending_events() {
        let batch = Batch::new("veh-1", "VIN1", 2).unwrap();
        let row = BatchRow {
            id: batch.id,
            vehicle_id: batch.vehicle_id.clone(),
            vin: batch.vin.clone(),
            status: "uploaded".to_string(),
            upload_time: batch.upload_time,
            total_files: 2,
            processed_files: 1,
            expected_worker_count: 2,
            completed_worker_count: 0,
            storage_bucket: "diag".to_string(),
            storage_prefix: "veh-1/".to_string(),
            error_message: None,
            completed_at: None,
            pending_events: Json(batch.pending_events()),
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        };

        let restored = Batch::try_from(row).unwrap();
        assert_eq!(restored.status, BatchStatus::Uploaded);
        assert_eq!(restored.total_files, 2);
        assert_eq!(restored.pending_events(), batch.pending_events());
    }

    #[test]
    fn test_batch_row_with_unknown_status_is_rejected() {
        let batch = Batch::new("veh-1", "VIN1", 1).unwrap();
        let row = BatchRow {
            id: batch.id,
            vehicle_id: batch.vehicle_id,
            vin: batch.vin,
            status: "exploded".to_string(),
            upload_time: batch.upload_time,
            total_files: 0,
            processed_files: 0,
            expected_worker_count: 1,
            completed_worker_count: 0,
            storage_bucket: String::new(),
            storage_prefix: String::new(),
            error_message: None,
            completed_at: None,
            pending_events: Json(Vec::new()),
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        };

        assert!(matches!(
            Batch::try_from(row),
            Err(ArgusError::Database(_))
        ));
    }
}
