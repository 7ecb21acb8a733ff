//! Shared fixtures for the integration suites: a fully in-memory orchestrator with
//! handles on every backend so tests can inspect or sabotage them.

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use argus_core::barrier::CompletionBarrier;
use argus_core::config::{CompensationConfig, ConsumerConfig, PublisherConfig};
use argus_core::domain::{Batch, BatchStatus, DomainEvent};
use argus_core::messaging::{EventBus, EventConsumer, InMemoryBus, ReliablePublisher};
use argus_core::orchestration::{Compensator, OrchestrationEngine};
use argus_core::repository::{
    BatchRepository, InMemoryBatchRepository, InMemoryFileRepository, InMemoryReportRepository,
};
use argus_core::services::{BatchService, FileUpload, QueryService};
use argus_core::store::{InMemorySharedStore, SharedStoreProvider};
use uuid::Uuid;

pub const TOPIC: &str = "batch-events";
pub const DEAD_LETTER_TOPIC: &str = "batch-events-dlq";

pub struct TestOrchestrator {
    pub bus: EventBus,
    pub store: SharedStoreProvider,
    pub batches: InMemoryBatchRepository,
    pub files: InMemoryFileRepository,
    pub reports: InMemoryReportRepository,
    pub engine: OrchestrationEngine,
    pub service: BatchService,
}

impl TestOrchestrator {
    pub fn new() -> Self {
        Self::with_partitions(4)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let bus = EventBus::in_memory(partitions);
        let store = SharedStoreProvider::new_in_memory();
        let batches = InMemoryBatchRepository::new();
        let files = InMemoryFileRepository::new();
        let reports = InMemoryReportRepository::new();

        let publisher = ReliablePublisher::new(bus.clone(), TOPIC, DEAD_LETTER_TOPIC, fast_publisher());
        let barrier = CompletionBarrier::new(store.clone(), Duration::from_secs(60));
        let engine = OrchestrationEngine::new(Arc::new(batches.clone()), barrier, publisher);
        let service = BatchService::new(
            Arc::new(batches.clone()),
            Arc::new(files.clone()),
            engine.clone(),
        );

        Self {
            bus,
            store,
            batches,
            files,
            reports,
            engine,
            service,
        }
    }

    pub fn memory_bus(&self) -> &InMemoryBus {
        self.bus.as_in_memory().expect("in-memory bus")
    }

    pub fn memory_store(&self) -> &InMemorySharedStore {
        self.store.as_in_memory().expect("in-memory store")
    }

    pub fn compensator(&self, config: CompensationConfig) -> Compensator {
        Compensator::new(self.engine.clone(), Arc::new(self.batches.clone()), config)
    }

    pub fn consumer(&self) -> EventConsumer {
        EventConsumer::new(
            self.bus.clone(),
            self.engine.clone(),
            TOPIC,
            ConsumerConfig {
                batch_size: 10,
                poll_interval_ms: 5,
                visibility_timeout_ms: 60_000,
                handler_timeout_ms: 2_000,
            },
        )
    }

    pub fn query_service(&self) -> QueryService {
        QueryService::new(
            Arc::new(self.batches.clone()),
            Arc::new(self.reports.clone()),
            self.store.clone(),
            self.engine.barrier().clone(),
            Duration::from_secs(600),
        )
    }

    /// Create a batch with `file_count` registered files and finish its upload.
    /// Returns the batch and its file ids.
    pub async fn uploaded_batch(&self, file_count: usize) -> (Batch, Vec<Uuid>) {
        let batch = self
            .service
            .create_batch("veh-001", "1HGCM82633A004352", 2)
            .await
            .unwrap();

        let mut file_ids = Vec::with_capacity(file_count);
        for index in 0..file_count {
            let file = self
                .service
                .add_file(batch.id, upload(&format!("log-{index}.csv")))
                .await
                .unwrap();
            file_ids.push(file.id);
        }

        let batch = self.service.complete_upload(batch.id).await.unwrap();
        (batch, file_ids)
    }

    /// Take a batch straight to `scattering` the way the first `BatchCreated` would.
    pub async fn scattering_batch(&self, file_count: usize) -> (Batch, Vec<Uuid>) {
        let (batch, file_ids) = self.uploaded_batch(file_count).await;
        self.engine
            .handle_event(&DomainEvent::batch_created(batch.id, &batch.vehicle_id, &batch.vin))
            .await
            .unwrap();
        (self.batch(batch.id), file_ids)
    }

    pub fn batch(&self, id: Uuid) -> Batch {
        self.batches.snapshot(id).expect("batch exists")
    }

    pub fn status(&self, id: Uuid) -> BatchStatus {
        self.batch(id).status
    }

    /// Rewrite `updated_at` so the batch looks idle for `age`.
    pub async fn age_batch(&self, id: Uuid, age: Duration) {
        let mut batch = self.batch(id);
        batch.updated_at = chrono::Utc::now() - chrono::Duration::from_std(age).unwrap();
        self.batches.save(&batch).await.unwrap();
    }

    /// `StatusChanged` transitions published for `batch_id`, in publish order.
    pub async fn published_transitions(&self, batch_id: Uuid) -> Vec<(BatchStatus, BatchStatus)> {
        self.memory_bus()
            .published_events(TOPIC)
            .await
            .into_iter()
            .filter_map(|event| match event {
                DomainEvent::BatchStatusChanged(e) if e.batch_id == batch_id => {
                    Some((e.old_status, e.new_status))
                }
                _ => None,
            })
            .collect()
    }
}

pub fn fast_publisher() -> PublisherConfig {
    PublisherConfig {
        max_attempts: 3,
        base_backoff_ms: 1,
        send_timeout_ms: 1_000,
        ..PublisherConfig::default()
    }
}

pub fn upload(name: &str) -> FileUpload {
    FileUpload {
        original_filename: name.to_string(),
        file_size: 4_096,
        storage_path: format!("raw/{name}"),
        storage_etag: format!("etag-{name}"),
    }
}

pub fn diagnosis_completed_payload(batch_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "event_type": "DiagnosisCompleted",
        "batch_id": batch_id,
        "diagnosis_id": Uuid::new_v4(),
        "diagnosis_summary": "Intermittent misfire on cylinder 3",
        "top_error_codes": [
            { "code": "P0303", "severity": "high", "count": 12 }
        ],
        "token_usage": { "prompt_tokens": 1200, "completion_tokens": 300, "total_tokens": 1500 },
        "timestamp": chrono::Utc::now(),
    }))
    .unwrap()
}
