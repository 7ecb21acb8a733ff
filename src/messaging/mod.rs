//! # Messaging Module
//!
//! The partitioned event bus the orchestration core consumes from and publishes to,
//! plus the reliable publisher and the consumption loop built on it.
//!
//! ## Providers
//!
//! - **PGMQ**: one PostgreSQL message queue per topic partition
//! - **InMemory**: partitioned queues with visibility timeouts for tests and development
//!
//! Providers sit behind [`EventBus`] (enum dispatch) so the publisher and consumer hold
//! one concrete type regardless of backend.

pub mod consumer;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod pgmq;
pub mod publisher;

pub use consumer::{ConsumerMetricsSnapshot, EventConsumer};
pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryBus;
pub use message::{headers, partition_for, OutboundMessage, ReceivedMessage, SendReceipt};
pub use pgmq::PgmqBus;
pub use publisher::{Acks, DeadLetterEnvelope, ProducerSettings, ReliablePublisher};

use async_trait::async_trait;
use std::time::Duration;

/// Provider-agnostic bus operations
#[async_trait]
pub trait BusService: Send + Sync + 'static {
    /// Create every partition of `topic` if missing (idempotent)
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()>;

    /// Send to the partition selected by the message key
    async fn send(&self, topic: &str, message: &OutboundMessage) -> MessagingResult<SendReceipt>;

    /// Claim up to `max_messages` visible messages from one partition, oldest first
    async fn receive(
        &self,
        topic: &str,
        partition: u32,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<ReceivedMessage>>;

    /// Acknowledge (delete) a processed message
    async fn ack(&self, message: &ReceivedMessage) -> MessagingResult<()>;

    fn partition_count(&self) -> u32;

    fn provider_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub enum EventBus {
    InMemory(InMemoryBus),
    Pgmq(Box<PgmqBus>),
}

impl EventBus {
    pub fn in_memory(partitions: u32) -> Self {
        Self::InMemory(InMemoryBus::new(partitions))
    }

    /// The in-memory provider, for tests that inspect or sabotage the bus.
    pub fn as_in_memory(&self) -> Option<&InMemoryBus> {
        match self {
            Self::InMemory(bus) => Some(bus),
            Self::Pgmq(_) => None,
        }
    }

    pub async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        match self {
            Self::InMemory(bus) => bus.ensure_topic(topic).await,
            Self::Pgmq(bus) => bus.ensure_topic(topic).await,
        }
    }

    pub async fn send(&self, topic: &str, message: &OutboundMessage) -> MessagingResult<SendReceipt> {
        match self {
            Self::InMemory(bus) => bus.send(topic, message).await,
            Self::Pgmq(bus) => bus.send(topic, message).await,
        }
    }

    pub async fn receive(
        &self,
        topic: &str,
        partition: u32,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<ReceivedMessage>> {
        match self {
            Self::InMemory(bus) => {
                bus.receive(topic, partition, max_messages, visibility_timeout)
                    .await
            }
            Self::Pgmq(bus) => {
                bus.receive(topic, partition, max_messages, visibility_timeout)
                    .await
            }
        }
    }

    pub async fn ack(&self, message: &ReceivedMessage) -> MessagingResult<()> {
        match self {
            Self::InMemory(bus) => bus.ack(message).await,
            Self::Pgmq(bus) => bus.ack(message).await,
        }
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            Self::InMemory(bus) => bus.partition_count(),
            Self::Pgmq(bus) => bus.partition_count(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::InMemory(bus) => bus.provider_name(),
            Self::Pgmq(bus) => bus.provider_name(),
        }
    }
}
