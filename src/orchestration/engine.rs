//! # Orchestration Engine
//!
//! Saga coordinator for the batch pipeline. Every inbound bus payload is decoded once into a
//! [`DomainEvent`] and routed to one handler per variant. Handlers share one shape:
//!
//! 1. load the batch (missing batches are `NotFound`, never silently skipped)
//! 2. publish any events a previous invocation failed to deliver, unless the batch is
//!    still `pending` (its upload window owns `BatchCreated`)
//! 3. apply transitions, skipping steps the batch has already reached
//! 4. persist, publish, and drop only the published prefix of the event log
//!
//! The engine holds no lock across invocations. Duplicate and concurrent deliveries are
//! absorbed by the transition table and by the barrier's idempotent inserts.
//!
//! Scatter completion needs one side of a race to see the other. `BatchCreated` persists
//! `scattering` before it reads the barrier count, and `FileParsed` re-reads the batch after
//! its barrier insert, so whichever runs second observes completion.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::barrier::{self, CompletionBarrier};
use crate::domain::{
    decode_event, Batch, BatchCreated, BatchStatus, BatchStatusChanged, DecodedEvent,
    DiagnosisCompleted, DomainEvent, FileParsed, GatheringCompleted,
};
use crate::error::{ArgusError, ArgusResult};
use crate::logging::log_batch_operation;
use crate::messaging::ReliablePublisher;
use crate::repository::BatchRepository;

/// Steps taken once every file has reported parsed.
const SCATTER_COMPLETION_PATH: [BatchStatus; 3] = [
    BatchStatus::Scattered,
    BatchStatus::Gathering,
    BatchStatus::Gathered,
];

/// Steps taken when aggregation reports back.
const GATHER_COMPLETION_PATH: [BatchStatus; 4] = [
    BatchStatus::Scattered,
    BatchStatus::Gathering,
    BatchStatus::Gathered,
    BatchStatus::Diagnosing,
];

/// Apply each step of `path` the batch has not reached yet. Returns the number applied.
pub fn advance_through(batch: &mut Batch, path: &[BatchStatus]) -> ArgusResult<usize> {
    let mut applied = 0;
    for &target in path {
        if batch.status.has_reached(target) {
            continue;
        }
        batch.transition_to(target)?;
        applied += 1;
    }
    Ok(applied)
}

#[derive(Clone)]
pub struct OrchestrationEngine {
    batches: Arc<dyn BatchRepository>,
    barrier: CompletionBarrier,
    publisher: ReliablePublisher,
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("topic", &self.publisher.topic())
            .finish_non_exhaustive()
    }
}

impl OrchestrationEngine {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        barrier: CompletionBarrier,
        publisher: ReliablePublisher,
    ) -> Self {
        Self {
            batches,
            barrier,
            publisher,
        }
    }

    pub fn barrier(&self) -> &CompletionBarrier {
        &self.barrier
    }

    pub fn publisher(&self) -> &ReliablePublisher {
        &self.publisher
    }

    /// Decode a raw bus payload and dispatch it.
    ///
    /// Unknown event types are logged and accepted. Undecodable payloads fail with
    /// `Serialization`, which the consumer treats as poison.
    pub async fn handle_message(&self, payload: &[u8]) -> ArgusResult<()> {
        match decode_event(payload)? {
            DecodedEvent::Known(event) => self.handle_event(&event).await,
            DecodedEvent::Unknown { event_type } => {
                warn!(event_type = %event_type, "Ignoring unknown event type");
                Ok(())
            }
        }
    }

    pub async fn handle_event(&self, event: &DomainEvent) -> ArgusResult<()> {
        debug!(
            event_type = event.event_type(),
            event_id = %event.event_id(),
            batch_id = %event.aggregate_id(),
            "Dispatching event"
        );

        match event {
            DomainEvent::BatchCreated(e) => self.handle_batch_created(e).await,
            DomainEvent::FileParsed(e) => self.handle_file_parsed(e).await,
            DomainEvent::GatheringCompleted(e) => self.handle_gathering_completed(e).await,
            DomainEvent::DiagnosisCompleted(e) => self.handle_diagnosis_completed(e).await,
            DomainEvent::BatchStatusChanged(e) => {
                self.handle_status_changed(e);
                Ok(())
            }
        }
    }

    /// Load a batch for mutation, first flushing events an earlier invocation left queued.
    ///
    /// A `pending` batch is never flushed: its `BatchCreated` stays queued until
    /// `complete_upload` closes the upload window.
    pub async fn load_batch(&self, batch_id: Uuid) -> ArgusResult<Batch> {
        let mut batch = self.find_batch(batch_id).await?;

        if batch.status != BatchStatus::Pending && batch.has_pending_events() {
            info!(
                batch_id = %batch_id,
                pending = batch.pending_events().len(),
                "🔁 Flushing previously unpublished events"
            );
            self.persist_and_publish(&mut batch).await?;
        }
        Ok(batch)
    }

    async fn find_batch(&self, batch_id: Uuid) -> ArgusResult<Batch> {
        self.batches
            .find_by_id(batch_id)
            .await?
            .ok_or(ArgusError::NotFound(batch_id))
    }

    /// Save the batch, publish its queued events, and drop the ones that went out.
    ///
    /// On a publish failure the undelivered suffix stays in the persisted event log and the
    /// error is returned so the triggering message is redelivered.
    pub async fn persist_and_publish(&self, batch: &mut Batch) -> ArgusResult<()> {
        self.batches.save(batch).await?;
        if !batch.has_pending_events() {
            return Ok(());
        }

        let events = batch.pending_events();
        match self.publisher.publish_events(&events).await {
            Ok(published) => {
                batch.mark_published(published);
                self.batches.save(batch).await
            }
            Err(error) => {
                if let ArgusError::PermanentPublishFailure { published, .. } = &error {
                    batch.mark_published(*published);
                    if let Err(save_error) = self.batches.save(batch).await {
                        warn!(
                            batch_id = %batch.id,
                            error = %save_error,
                            "Could not trim delivered events after publish failure"
                        );
                    }
                }
                Err(error)
            }
        }
    }

    async fn handle_batch_created(&self, event: &BatchCreated) -> ArgusResult<()> {
        let mut batch = self.load_batch(event.batch_id).await?;

        if batch.status.has_reached(BatchStatus::Scattering) || batch.status.is_terminal() {
            debug!(
                batch_id = %batch.id,
                status = %batch.status,
                "BatchCreated already applied"
            );
            return Ok(());
        }

        advance_through(
            &mut batch,
            &[BatchStatus::Uploaded, BatchStatus::Scattering],
        )?;
        self.persist_and_publish(&mut batch).await?;

        // Read the barrier only once scattering is persisted. A FileParsed recorded after
        // this read observes scattering on its own reload and completes the scatter itself.
        let count = self.barrier.count(batch.id).await?;
        if barrier::is_complete(count, batch.total_files) {
            batch.record_processed_count(saturating_count(count));
            advance_through(&mut batch, &SCATTER_COMPLETION_PATH)?;
            self.persist_and_publish(&mut batch).await?;
            self.release_barrier(batch.id).await;
        }

        log_batch_operation(
            "batch_created",
            batch.id,
            batch.status.as_str(),
            Some("scatter started"),
        );
        Ok(())
    }

    async fn handle_file_parsed(&self, event: &FileParsed) -> ArgusResult<()> {
        let batch = self.load_batch(event.batch_id).await?;
        if scatter_finished(batch.status) {
            debug!(
                batch_id = %batch.id,
                file_id = %event.file_id,
                status = %batch.status,
                "FileParsed after scatter completed"
            );
            return Ok(());
        }

        let observation = self.barrier.record(batch.id, event.file_id).await?;

        // Re-read after recording so the decision sees both the persisted total and any
        // scatter start or completion that raced with the insert
        let mut batch = self.find_batch(event.batch_id).await?;

        if scatter_finished(batch.status) {
            // A concurrent handler released the set before our insert re-created it
            self.release_barrier(batch.id).await;
            debug!(
                batch_id = %batch.id,
                file_id = %event.file_id,
                status = %batch.status,
                "Scatter completed concurrently"
            );
            return Ok(());
        }

        if batch.status != BatchStatus::Scattering {
            // Uploads still open; BatchCreated re-checks the barrier once scatter starts
            debug!(
                batch_id = %batch.id,
                status = %batch.status,
                count = observation.count,
                "FileParsed recorded before scatter started"
            );
            return Ok(());
        }

        if !observation.is_complete(batch.total_files) {
            info!(
                batch_id = %batch.id,
                processed = observation.count,
                total = batch.total_files,
                "📊 File parsed"
            );
            return Ok(());
        }

        batch.record_processed_count(saturating_count(observation.count));
        advance_through(&mut batch, &SCATTER_COMPLETION_PATH)?;
        self.persist_and_publish(&mut batch).await?;
        self.release_barrier(batch.id).await;

        log_batch_operation(
            "file_parsed",
            batch.id,
            batch.status.as_str(),
            Some("all files parsed"),
        );
        Ok(())
    }

    async fn handle_gathering_completed(&self, event: &GatheringCompleted) -> ArgusResult<()> {
        let mut batch = self.load_batch(event.batch_id).await?;
        let from_scattering = batch.status == BatchStatus::Scattering;

        match batch.status {
            BatchStatus::Scattering
            | BatchStatus::Scattered
            | BatchStatus::Gathering
            | BatchStatus::Gathered => {}
            BatchStatus::Diagnosing | BatchStatus::Completed => {
                debug!(
                    batch_id = %batch.id,
                    status = %batch.status,
                    "GatheringCompleted already applied"
                );
                return Ok(());
            }
            other => {
                return Err(ArgusError::invalid_state(format!(
                    "GatheringCompleted for batch {} in status {other}",
                    batch.id
                )));
            }
        }

        if from_scattering {
            warn!(
                batch_id = %batch.id,
                "GatheringCompleted arrived while scattering; completing scatter from it"
            );
            batch.record_processed_count(event.total_files);
        }

        advance_through(&mut batch, &GATHER_COMPLETION_PATH)?;
        self.persist_and_publish(&mut batch).await?;
        if from_scattering {
            self.release_barrier(batch.id).await;
        }

        log_batch_operation(
            "gathering_completed",
            batch.id,
            batch.status.as_str(),
            Some(&format!("{} chart references", event.chart_refs.len())),
        );
        Ok(())
    }

    async fn handle_diagnosis_completed(&self, event: &DiagnosisCompleted) -> ArgusResult<()> {
        let mut batch = self.load_batch(event.batch_id).await?;

        if batch.status == BatchStatus::Completed {
            debug!(batch_id = %batch.id, "DiagnosisCompleted already applied");
            return Ok(());
        }

        batch.complete()?;
        self.persist_and_publish(&mut batch).await?;

        info!(
            batch_id = %batch.id,
            diagnosis_id = %event.diagnosis_id,
            error_codes = event.top_error_codes.len(),
            total_tokens = event.token_usage.total_tokens,
            "✅ Batch completed"
        );
        Ok(())
    }

    fn handle_status_changed(&self, event: &BatchStatusChanged) {
        debug!(
            batch_id = %event.batch_id,
            old_status = %event.old_status,
            new_status = %event.new_status,
            "Status change observed"
        );
    }

    /// The set also expires on its own, so a failed delete is only logged.
    async fn release_barrier(&self, batch_id: Uuid) {
        if let Err(error) = self.barrier.release(batch_id).await {
            warn!(batch_id = %batch_id, error = %error, "Barrier release failed");
        }
    }
}

/// Whether FileParsed can no longer move the batch.
fn scatter_finished(status: BatchStatus) -> bool {
    status.has_reached(BatchStatus::Scattered) || status.is_terminal()
}

fn saturating_count(count: u64) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
