//! # Batch Aggregate
//!
//! Authoritative lifecycle of one vehicle-diagnostic upload. All mutation goes through the
//! methods below so the counting invariants and the transition table hold; every status
//! change queues exactly one `StatusChanged` event in the aggregate's pending event log.
//!
//! The event log is owned by the aggregate. Readers get a copy via
//! [`Batch::pending_events`]; entries are dropped only once the caller reports them
//! published ([`Batch::mark_published`] / [`Batch::clear_events`]).

use crate::domain::{BatchStatus, DomainEvent};
use crate::error::{ArgusError, ArgusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub vehicle_id: String,
    pub vin: String,
    pub status: BatchStatus,
    pub upload_time: DateTime<Utc>,
    pub total_files: u32,
    pub processed_files: u32,
    pub expected_worker_count: u32,
    pub completed_worker_count: u32,
    pub storage_bucket: String,
    pub storage_prefix: String,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) events: Vec<DomainEvent>,
}

impl Batch {
    /// Create a batch in `pending` with its `BatchCreated` event already queued.
    pub fn new(vehicle_id: &str, vin: &str, expected_worker_count: u32) -> ArgusResult<Self> {
        if vehicle_id.trim().is_empty() {
            return Err(ArgusError::validation("vehicle_id must not be empty"));
        }
        if vin.trim().is_empty() {
            return Err(ArgusError::validation("vin must not be empty"));
        }
        if expected_worker_count == 0 {
            return Err(ArgusError::validation(
                "expected_worker_count must be greater than zero",
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();

        Ok(Self {
            id,
            vehicle_id: vehicle_id.to_string(),
            vin: vin.to_string(),
            status: BatchStatus::Pending,
            upload_time: now,
            total_files: 0,
            processed_files: 0,
            expected_worker_count,
            completed_worker_count: 0,
            storage_bucket: String::new(),
            storage_prefix: String::new(),
            error_message: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            events: vec![DomainEvent::batch_created(id, vehicle_id, vin)],
        })
    }

    /// Rehydrate a persisted batch, including events that were never published.
    pub fn with_pending_events(mut self, events: Vec<DomainEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_storage_location(mut self, bucket: &str, prefix: &str) -> Self {
        self.storage_bucket = bucket.to_string();
        self.storage_prefix = prefix.to_string();
        self
    }

    /// Move to `target` along an allowed edge and queue the matching `StatusChanged`.
    ///
    /// Rejected edges leave the aggregate untouched.
    pub fn transition_to(&mut self, target: BatchStatus) -> ArgusResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(ArgusError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        let old_status = self.status;
        self.status = target;
        self.updated_at = Utc::now();
        self.events
            .push(DomainEvent::status_changed(self.id, old_status, target));
        Ok(())
    }

    /// Transition to `failed` and record why.
    pub fn fail(&mut self, reason: impl Into<String>) -> ArgusResult<()> {
        self.transition_to(BatchStatus::Failed)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Transition to `completed` and stamp the completion time.
    pub fn complete(&mut self) -> ArgusResult<()> {
        self.transition_to(BatchStatus::Completed)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Register one more file. Only allowed before parsing starts.
    pub fn add_file(&mut self, file_id: Uuid) -> ArgusResult<()> {
        if file_id.is_nil() {
            return Err(ArgusError::validation("file_id must not be nil"));
        }
        if !self.status.accepts_files() {
            return Err(ArgusError::invalid_state(format!(
                "batch {} is {}; files can only be added while pending or uploaded",
                self.id, self.status
            )));
        }

        self.total_files += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn increment_worker_count(&mut self) -> ArgusResult<()> {
        if self.completed_worker_count >= self.expected_worker_count {
            return Err(ArgusError::invalid_state(format!(
                "all {} workers already completed for batch {}",
                self.expected_worker_count, self.id
            )));
        }
        self.completed_worker_count += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_file_processed(&mut self) -> ArgusResult<()> {
        if self.processed_files >= self.total_files {
            return Err(ArgusError::invalid_state(format!(
                "all {} files already processed for batch {}",
                self.total_files, self.id
            )));
        }
        self.processed_files += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sync the processed count from the completion barrier, clamped to `total_files`.
    pub fn record_processed_count(&mut self, count: u32) {
        let clamped = count.min(self.total_files);
        if clamped != self.processed_files {
            self.processed_files = clamped;
            self.updated_at = Utc::now();
        }
    }

    /// Copy of the not-yet-published events, oldest first.
    pub fn pending_events(&self) -> Vec<DomainEvent> {
        self.events.clone()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Drop the first `count` events after they were delivered.
    pub fn mark_published(&mut self, count: usize) {
        let count = count.min(self.events.len());
        self.events.drain(..count);
    }

    pub fn all_files_processed(&self) -> bool {
        self.total_files > 0 && self.processed_files >= self.total_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_batch() -> Batch {
        Batch::new("veh-1", "VIN1", 3).unwrap()
    }

    #[test]
    fn test_new_batch_queues_creation_event() {
        let batch = new_batch();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_files, 0);

        let events = batch.pending_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DomainEvent::BatchCreated(e) => {
                assert_eq!(e.batch_id, batch.id);
                assert_eq!(e.vehicle_id, "veh-1");
                assert_eq!(e.vin, "VIN1");
            }
            other => panic!("expected BatchCreated, got {other:?}"),
        }
    }

    #[test]
    fn test_new_batch_validation() {
        assert!(matches!(
            Batch::new("", "VIN1", 1),
            Err(ArgusError::Validation(_))
        ));
        assert!(matches!(
            Batch::new("veh-1", "  ", 1),
            Err(ArgusError::Validation(_))
        ));
        assert!(matches!(
            Batch::new("veh-1", "VIN1", 0),
            Err(ArgusError::Validation(_))
        ));
    }

    #[test]
    fn test_transition_appends_one_status_changed() {
        let mut batch = new_batch();
        let before = batch.updated_at;
        batch.transition_to(BatchStatus::Uploaded).unwrap();

        assert_eq!(batch.status, BatchStatus::Uploaded);
        assert!(batch.updated_at >= before);
        let events = batch.pending_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            DomainEvent::BatchStatusChanged(e)
                if e.old_status == BatchStatus::Pending && e.new_status == BatchStatus::Uploaded
        ));
    }

    #[test]
    fn test_rejected_transition_leaves_state_unchanged() {
        let mut batch = new_batch();
        let snapshot = batch.clone();
        let err = batch.transition_to(BatchStatus::Gathering).unwrap_err();

        assert_eq!(
            err,
            ArgusError::InvalidTransition {
                from: BatchStatus::Pending,
                to: BatchStatus::Gathering
            }
        );
        assert_eq!(batch, snapshot);
    }

    #[test]
    fn test_add_file_only_before_scattering() {
        let mut batch = new_batch();
        batch.add_file(Uuid::new_v4()).unwrap();
        batch.transition_to(BatchStatus::Uploaded).unwrap();
        batch.add_file(Uuid::new_v4()).unwrap();
        assert_eq!(batch.total_files, 2);

        batch.transition_to(BatchStatus::Scattering).unwrap();
        let err = batch.add_file(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ArgusError::InvalidState(_)));
        assert_eq!(batch.total_files, 2);
    }

    #[test]
    fn test_add_file_rejects_nil_id() {
        let mut batch = new_batch();
        assert!(matches!(
            batch.add_file(Uuid::nil()),
            Err(ArgusError::Validation(_))
        ));
        assert_eq!(batch.total_files, 0);
    }

    #[test]
    fn test_counters_are_bounded() {
        let mut batch = Batch::new("veh-1", "VIN1", 1).unwrap();
        batch.add_file(Uuid::new_v4()).unwrap();

        batch.mark_file_processed().unwrap();
        assert!(batch.mark_file_processed().is_err());
        assert_eq!(batch.processed_files, 1);

        batch.increment_worker_count().unwrap();
        assert!(batch.increment_worker_count().is_err());
        assert_eq!(batch.completed_worker_count, 1);

        batch.record_processed_count(10);
        assert_eq!(batch.processed_files, 1);
    }

    #[test]
    fn test_pending_events_is_a_copy() {
        let mut batch = new_batch();
        let mut copy = batch.pending_events();
        copy.clear();
        assert_eq!(batch.pending_events().len(), 1);

        batch.transition_to(BatchStatus::Uploaded).unwrap();
        assert!(copy.is_empty());
    }

    #[test]
    fn test_mark_published_drops_prefix_only() {
        let mut batch = new_batch();
        batch.transition_to(BatchStatus::Uploaded).unwrap();
        batch.transition_to(BatchStatus::Scattering).unwrap();
        let all = batch.pending_events();

        batch.mark_published(2);
        assert_eq!(batch.pending_events(), all[2..].to_vec());

        batch.mark_published(10);
        assert!(!batch.has_pending_events());
    }

    #[test]
    fn test_fail_and_complete_helpers() {
        let mut batch = new_batch();
        batch.transition_to(BatchStatus::Uploaded).unwrap();
        batch.transition_to(BatchStatus::Scattering).unwrap();
        batch.fail("parser crashed").unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_message.as_deref(), Some("parser crashed"));

        let mut done = new_batch();
        for status in [
            BatchStatus::Uploaded,
            BatchStatus::Scattering,
            BatchStatus::Scattered,
            BatchStatus::Gathering,
            BatchStatus::Gathered,
            BatchStatus::Diagnosing,
        ] {
            done.transition_to(status).unwrap();
        }
        done.complete().unwrap();
        assert_eq!(done.completed_at, Some(done.updated_at));
    }
}
