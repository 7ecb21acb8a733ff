//! # Domain Events
//!
//! Closed sum type over every event that crosses the bus, plus its wire encoding.
//!
//! ## Wire format
//!
//! Each variant is a flat JSON object carrying a string `event_type` discriminator, the
//! aggregate identity as `batch_id`, an RFC 3339 `timestamp`, and variant-specific
//! fields. `GatheringCompleted` and `DiagnosisCompleted` also carry a `version` string.
//! Payloads are decoded once at the boundary by [`decode_event`]; handlers only ever see a
//! typed [`DomainEvent`].

use crate::domain::BatchStatus;
use crate::error::{ArgusError, ArgusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version stamped on versioned variants produced by this crate.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

pub mod event_types {
    pub const BATCH_CREATED: &str = "BatchCreated";
    pub const STATUS_CHANGED: &str = "StatusChanged";
    pub const FILE_PARSED: &str = "FileParsed";
    pub const GATHERING_COMPLETED: &str = "GatheringCompleted";
    pub const DIAGNOSIS_COMPLETED: &str = "DiagnosisCompleted";

    pub const ALL: [&str; 5] = [
        BATCH_CREATED,
        STATUS_CHANGED,
        FILE_PARSED,
        GATHERING_COMPLETED,
        DIAGNOSIS_COMPLETED,
    ];
}

fn default_version() -> String {
    EVENT_SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreated {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub batch_id: Uuid,
    pub vehicle_id: String,
    pub vin: String,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusChanged {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub batch_id: Uuid,
    pub old_status: BatchStatus,
    pub new_status: BatchStatus,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

/// Emitted by a native parsing worker for every file it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileParsed {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub batch_id: Uuid,
    pub file_id: Uuid,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

/// Emitted by the aggregation worker with references to the charts it rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheringCompleted {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    #[serde(default = "default_version")]
    pub version: String,
    pub batch_id: Uuid,
    pub total_files: u32,
    #[serde(default, rename = "chart_files")]
    pub chart_refs: Vec<String>,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCodeSummary {
    pub code: String,
    pub severity: String,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub estimated_cost: f64,
}

/// Emitted by the inference worker once a diagnosis is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisCompleted {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    #[serde(default = "default_version")]
    pub version: String,
    pub batch_id: Uuid,
    pub diagnosis_id: Uuid,
    #[serde(rename = "diagnosis_summary")]
    pub summary: String,
    #[serde(default)]
    pub top_error_codes: Vec<ErrorCodeSummary>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum DomainEvent {
    BatchCreated(BatchCreated),
    #[serde(rename = "StatusChanged")]
    BatchStatusChanged(BatchStatusChanged),
    FileParsed(FileParsed),
    GatheringCompleted(GatheringCompleted),
    DiagnosisCompleted(DiagnosisCompleted),
}

impl DomainEvent {
    pub fn batch_created(batch_id: Uuid, vehicle_id: &str, vin: &str) -> Self {
        Self::BatchCreated(BatchCreated {
            event_id: Uuid::new_v4(),
            batch_id,
            vehicle_id: vehicle_id.to_string(),
            vin: vin.to_string(),
            occurred_at: Utc::now(),
        })
    }

    pub fn status_changed(batch_id: Uuid, old_status: BatchStatus, new_status: BatchStatus) -> Self {
        Self::BatchStatusChanged(BatchStatusChanged {
            event_id: Uuid::new_v4(),
            batch_id,
            old_status,
            new_status,
            occurred_at: Utc::now(),
        })
    }

    pub fn file_parsed(batch_id: Uuid, file_id: Uuid) -> Self {
        Self::FileParsed(FileParsed {
            event_id: Uuid::new_v4(),
            batch_id,
            file_id,
            occurred_at: Utc::now(),
        })
    }

    pub fn gathering_completed(batch_id: Uuid, total_files: u32, chart_refs: Vec<String>) -> Self {
        Self::GatheringCompleted(GatheringCompleted {
            event_id: Uuid::new_v4(),
            version: default_version(),
            batch_id,
            total_files,
            chart_refs,
            occurred_at: Utc::now(),
        })
    }

    /// Discriminator used on the wire and for dispatch.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BatchCreated(_) => event_types::BATCH_CREATED,
            Self::BatchStatusChanged(_) => event_types::STATUS_CHANGED,
            Self::FileParsed(_) => event_types::FILE_PARSED,
            Self::GatheringCompleted(_) => event_types::GATHERING_COMPLETED,
            Self::DiagnosisCompleted(_) => event_types::DIAGNOSIS_COMPLETED,
        }
    }

    /// Identity of the batch this event belongs to; also the bus partition key.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::BatchCreated(e) => e.batch_id,
            Self::BatchStatusChanged(e) => e.batch_id,
            Self::FileParsed(e) => e.batch_id,
            Self::GatheringCompleted(e) => e.batch_id,
            Self::DiagnosisCompleted(e) => e.batch_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::BatchCreated(e) => e.occurred_at,
            Self::BatchStatusChanged(e) => e.occurred_at,
            Self::FileParsed(e) => e.occurred_at,
            Self::GatheringCompleted(e) => e.occurred_at,
            Self::DiagnosisCompleted(e) => e.occurred_at,
        }
    }

    /// Stable per-event identity, used as the producer idempotency key.
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::BatchCreated(e) => e.event_id,
            Self::BatchStatusChanged(e) => e.event_id,
            Self::FileParsed(e) => e.event_id,
            Self::GatheringCompleted(e) => e.event_id,
            Self::DiagnosisCompleted(e) => e.event_id,
        }
    }

    pub fn partition_key(&self) -> String {
        self.aggregate_id().to_string()
    }

    pub fn to_wire_bytes(&self) -> ArgusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome of decoding one bus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Known(DomainEvent),
    /// A well-formed message whose `event_type` this build does not handle.
    Unknown { event_type: String },
}

#[derive(Deserialize)]
struct Discriminator {
    event_type: Option<String>,
}

/// Decode a wire payload into a typed event.
///
/// Unknown discriminators are not errors: the bus may carry event types from newer
/// producers. A missing discriminator or a known type with missing fields is a
/// `Serialization` error.
pub fn decode_event(payload: &[u8]) -> ArgusResult<DecodedEvent> {
    let discriminator: Discriminator = serde_json::from_slice(payload)?;
    let event_type = discriminator
        .event_type
        .ok_or_else(|| ArgusError::Serialization("missing event_type discriminator".into()))?;

    if !event_types::ALL.contains(&event_type.as_str()) {
        return Ok(DecodedEvent::Unknown { event_type });
    }

    let event: DomainEvent = serde_json::from_slice(payload)?;
    Ok(DecodedEvent::Known(event))
}
