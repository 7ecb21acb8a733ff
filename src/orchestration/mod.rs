//! # Orchestration
//!
//! The event-driven saga that advances batches through their lifecycle, and the
//! compensation sweep that rescues batches whose triggering event was lost.

pub mod compensation;
pub mod engine;

pub use compensation::{CompensationAction, Compensator, SweepReport};
pub use engine::{advance_through, OrchestrationEngine};
