//! # Domain Model
//!
//! Pure aggregate logic with no I/O: the batch lifecycle, per-file processing status,
//! the domain event sum type and the report read model.

pub mod batch;
pub mod events;
pub mod file;
pub mod report;
pub mod status;

pub use batch::Batch;
pub use events::{
    decode_event, BatchCreated, BatchStatusChanged, DecodedEvent, DiagnosisCompleted,
    DomainEvent, ErrorCodeSummary, FileParsed, GatheringCompleted, TokenUsage,
    EVENT_SCHEMA_VERSION,
};
pub use file::{FileRecord, ProcessingStatus};
pub use report::{BatchProgress, CpuStats, RamStats, Report};
pub use status::BatchStatus;
