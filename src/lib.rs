#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, PGMQ in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Argus Core
//!
//! Event-driven orchestration core for the vehicle-diagnostic batch pipeline.
//!
//! ## Overview
//!
//! An upload of vehicle log files becomes a **batch**. The batch fans out to native parsing
//! workers (scatter), fans back in once every file reports parsed (gather), and is then
//! handed to a diagnosis worker. This crate owns the authoritative lifecycle of a batch and
//! coordinates the workers purely through events on a partitioned bus.
//!
//! ## Architecture
//!
//! - **Batch aggregate**: the lifecycle state machine and its queued domain events
//! - **Reliable publisher**: ordered, retried, idempotent delivery with a dead-letter topic
//! - **Completion barrier**: a shared-store set that detects the last parsed file
//! - **Orchestration engine**: the saga that reacts to events and advances batches
//! - **Compensation**: a periodic sweep that rescues batches whose trigger was lost
//! - **Query service**: cached reports with request coalescing, plus live progress
//!
//! ## Module Organization
//!
//! - [`domain`] - Batch, file and report types, domain events and their wire format
//! - [`barrier`] - Distributed completion barrier
//! - [`messaging`] - Bus providers, publisher and consumer
//! - [`orchestration`] - Saga engine and compensation sweep
//! - [`repository`] - Persistence traits with PostgreSQL and in-memory implementations
//! - [`services`] - Ingestion and query services
//! - [`store`] - Shared fast store (Redis or in-memory)
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use argus_core::barrier::CompletionBarrier;
//! use argus_core::config::PublisherConfig;
//! use argus_core::messaging::{EventBus, ReliablePublisher};
//! use argus_core::orchestration::OrchestrationEngine;
//! use argus_core::repository::InMemoryBatchRepository;
//! use argus_core::store::SharedStoreProvider;
//!
//! # async fn example() -> argus_core::ArgusResult<()> {
//! let bus = EventBus::in_memory(4);
//! let publisher = ReliablePublisher::new(
//!     bus.clone(),
//!     "batch-events",
//!     "batch-events-dlq",
//!     PublisherConfig::default(),
//! );
//! let barrier = CompletionBarrier::new(
//!     SharedStoreProvider::new_in_memory(),
//!     Duration::from_secs(24 * 60 * 60),
//! );
//! let engine = OrchestrationEngine::new(
//!     Arc::new(InMemoryBatchRepository::new()),
//!     barrier,
//!     publisher,
//! );
//! engine.handle_message(br#"{"event_type":"SomethingNew"}"#).await?;
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod repository;
pub mod services;
pub mod store;

pub use barrier::{BarrierObservation, CompletionBarrier};
pub use crate::config::{ArgusConfig, ConfigManager};
pub use domain::{
    decode_event, Batch, BatchProgress, BatchStatus, DecodedEvent, DomainEvent, FileRecord,
    ProcessingStatus, Report,
};
pub use error::{ArgusError, ArgusResult};
pub use messaging::{EventBus, EventConsumer, ReliablePublisher};
pub use orchestration::{Compensator, OrchestrationEngine, SweepReport};
pub use services::{BatchService, QueryService};
pub use store::SharedStoreProvider;
