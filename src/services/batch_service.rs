//! # Batch Ingestion Service
//!
//! Write-side operations used by the upload front end: create a batch, register its files,
//! and mark the upload complete. A new batch keeps its `BatchCreated` event in the
//! persisted event log until `complete_upload`, so parsing workers are only triggered once
//! every file is registered.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::{Batch, BatchStatus, FileRecord};
use crate::error::{ArgusError, ArgusResult};
use crate::orchestration::OrchestrationEngine;
use crate::repository::{BatchRepository, FileRepository};

/// Storage coordinates of an uploaded file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileUpload {
    pub original_filename: String,
    pub file_size: i64,
    pub storage_path: String,
    pub storage_etag: String,
}

#[derive(Clone)]
pub struct BatchService {
    batches: Arc<dyn BatchRepository>,
    files: Arc<dyn FileRepository>,
    engine: OrchestrationEngine,
}

impl std::fmt::Debug for BatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchService").finish_non_exhaustive()
    }
}

impl BatchService {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        files: Arc<dyn FileRepository>,
        engine: OrchestrationEngine,
    ) -> Self {
        Self {
            batches,
            files,
            engine,
        }
    }

    pub async fn create_batch(
        &self,
        vehicle_id: &str,
        vin: &str,
        expected_worker_count: u32,
    ) -> ArgusResult<Batch> {
        let batch = Batch::new(vehicle_id, vin, expected_worker_count)?;
        self.batches.save(&batch).await?;

        info!(
            batch_id = %batch.id,
            vehicle_id = %batch.vehicle_id,
            vin = %batch.vin,
            "📦 Batch created"
        );
        Ok(batch)
    }

    /// Register one uploaded file against a batch that still accepts files.
    pub async fn add_file(&self, batch_id: Uuid, upload: FileUpload) -> ArgusResult<FileRecord> {
        let mut batch = self.find_batch(batch_id).await?;
        let file = FileRecord::new(batch_id, &upload.original_filename, upload.file_size)?
            .with_storage(&upload.storage_path, &upload.storage_etag);

        batch.add_file(file.id)?;
        self.files.save(&file).await?;
        self.batches.save(&batch).await?;

        info!(
            batch_id = %batch_id,
            file_id = %file.id,
            total_files = batch.total_files,
            "File registered"
        );
        Ok(file)
    }

    /// Close the upload window (pending to uploaded) and emit the queued events.
    ///
    /// Calling it again on an uploaded batch only re-flushes events still queued.
    pub async fn complete_upload(&self, batch_id: Uuid) -> ArgusResult<Batch> {
        let mut batch = self.find_batch(batch_id).await?;

        match batch.status {
            BatchStatus::Pending => batch.transition_to(BatchStatus::Uploaded)?,
            BatchStatus::Uploaded => {}
            other => {
                return Err(ArgusError::invalid_state(format!(
                    "cannot complete upload for batch {batch_id} in status {other}"
                )));
            }
        }

        self.engine.persist_and_publish(&mut batch).await?;
        info!(
            batch_id = %batch_id,
            total_files = batch.total_files,
            "⬆️ Upload completed"
        );
        Ok(batch)
    }

    /// Apply one transition, then persist and publish it.
    pub async fn transition_batch_status(
        &self,
        batch_id: Uuid,
        target: BatchStatus,
    ) -> ArgusResult<Batch> {
        let mut batch = self.find_batch(batch_id).await?;
        batch.transition_to(target)?;
        self.engine.persist_and_publish(&mut batch).await?;
        Ok(batch)
    }

    pub async fn list_files(&self, batch_id: Uuid) -> ArgusResult<Vec<FileRecord>> {
        self.files.find_by_batch_id(batch_id).await
    }

    async fn find_batch(&self, batch_id: Uuid) -> ArgusResult<Batch> {
        self.batches
            .find_by_id(batch_id)
            .await?
            .ok_or(ArgusError::NotFound(batch_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::CompletionBarrier;
    use crate::config::PublisherConfig;
    use crate::domain::DomainEvent;
    use crate::messaging::{EventBus, ReliablePublisher};
    use crate::repository::{InMemoryBatchRepository, InMemoryFileRepository};
    use crate::store::SharedStoreProvider;
    use std::time::Duration;

    fn service() -> (BatchService, InMemoryBatchRepository, EventBus) {
        let batches = InMemoryBatchRepository::new();
        let bus = EventBus::in_memory(2);
        let publisher = ReliablePublisher::new(
            bus.clone(),
            "batch-events",
            "batch-events-dlq",
            PublisherConfig::default(),
        );
        let barrier =
            CompletionBarrier::new(SharedStoreProvider::new_in_memory(), Duration::from_secs(60));
        let engine = OrchestrationEngine::new(Arc::new(batches.clone()), barrier, publisher);
        let service = BatchService::new(
            Arc::new(batches.clone()),
            Arc::new(InMemoryFileRepository::new()),
            engine,
        );
        (service, batches, bus)
    }

    fn upload(name: &str) -> FileUpload {
        FileUpload {
            original_filename: name.to_string(),
            file_size: 1024,
            storage_path: format!("raw/{name}"),
            storage_etag: "etag".to_string(),
        }
    }

    #[tokio::test]
    async fn test_creation_event_waits_for_upload_completion() {
        let (service, batches, bus) = service();
        let batch = service.create_batch("veh-1", "VIN1", 2).await.unwrap();
        service.add_file(batch.id, upload("a.log")).await.unwrap();
        service.add_file(batch.id, upload("b.log")).await.unwrap();

        let memory = bus.as_in_memory().unwrap();
        assert!(memory.published_events("batch-events").await.is_empty());

        let uploaded = service.complete_upload(batch.id).await.unwrap();
        assert_eq!(uploaded.status, BatchStatus::Uploaded);
        assert_eq!(uploaded.total_files, 2);

        let published = memory.published_events("batch-events").await;
        assert_eq!(published.len(), 2);
        assert!(matches!(published[0], DomainEvent::BatchCreated(_)));
        assert!(matches!(published[1], DomainEvent::BatchStatusChanged(_)));
        assert!(!batches.snapshot(batch.id).unwrap().has_pending_events());

        // Idempotent on an uploaded batch
        service.complete_upload(batch.id).await.unwrap();
        assert_eq!(memory.published_events("batch-events").await.len(), 2);
    }

    #[tokio::test]
    async fn test_files_rejected_once_scatter_started() {
        let (service, _, _) = service();
        let batch = service.create_batch("veh-1", "VIN1", 1).await.unwrap();
        service.complete_upload(batch.id).await.unwrap();
        service
            .transition_batch_status(batch.id, BatchStatus::Scattering)
            .await
            .unwrap();

        let err = service.add_file(batch.id, upload("late.log")).await.unwrap_err();
        assert!(matches!(err, ArgusError::InvalidState(_)));
        assert!(service.list_files(batch.id).await.unwrap().is_empty());

        let err = service.complete_upload(batch.id).await.unwrap_err();
        assert!(matches!(err, ArgusError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let (service, _, _) = service();
        let id = Uuid::new_v4();
        assert_eq!(
            service.add_file(id, upload("x.log")).await.unwrap_err(),
            ArgusError::NotFound(id)
        );
    }
}
