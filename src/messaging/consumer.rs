//! # Event Consumer
//!
//! Drives the orchestration engine from the bus. One worker task per partition claims
//! messages, runs the handler under a timeout, and decides the message's fate from the
//! result:
//!
//! - `Ok` or an unknown event type: acknowledged
//! - non-retryable error: forwarded to the dead-letter topic as poison, then acknowledged
//! - retryable error or timeout: left unacknowledged for redelivery, and the rest of the
//!   claimed batch is skipped so later messages for the same key are not handled first
//!
//! Workers stop claiming once the shutdown token is cancelled; a handler already running
//! is allowed to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventBus, ReceivedMessage};
use crate::config::ConsumerConfig;
use crate::error::{ArgusError, ArgusResult};
use crate::orchestration::OrchestrationEngine;

#[derive(Debug, Default)]
struct ConsumerMetrics {
    received: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    handler_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerMetricsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub handler_timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    DeadLetterAndAck,
    Redeliver,
}

#[derive(Clone)]
pub struct EventConsumer {
    bus: EventBus,
    engine: OrchestrationEngine,
    topic: String,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("topic", &self.topic)
            .field("provider", &self.bus.provider_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventConsumer {
    pub fn new(
        bus: EventBus,
        engine: OrchestrationEngine,
        topic: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            bus,
            engine,
            topic: topic.into(),
            config,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            received: self.metrics.received.load(Ordering::Relaxed),
            acknowledged: self.metrics.acknowledged.load(Ordering::Relaxed),
            redelivered: self.metrics.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.metrics.dead_lettered.load(Ordering::Relaxed),
            handler_timeouts: self.metrics.handler_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Consume every partition until `shutdown` is cancelled, then wait for the workers.
    pub async fn run(&self, shutdown: CancellationToken) -> ArgusResult<()> {
        self.bus.ensure_topic(&self.topic).await?;
        let partitions = self.bus.partition_count();

        info!(
            topic = %self.topic,
            partitions = partitions,
            provider = self.bus.provider_name(),
            "🚀 Starting event consumer"
        );

        let mut workers = JoinSet::new();
        for partition in 0..partitions {
            let consumer = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { consumer.run_partition(partition, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Partition worker panicked");
            }
        }

        info!(topic = %self.topic, "🛑 Event consumer stopped");
        Ok(())
    }

    async fn run_partition(&self, partition: u32, shutdown: CancellationToken) {
        debug!(topic = %self.topic, partition = partition, "Partition worker started");

        while !shutdown.is_cancelled() {
            let claimed = match self.poll_once(partition).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(partition = partition, error = %e, "Polling partition failed");
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        debug!(topic = %self.topic, partition = partition, "Partition worker stopped");
    }

    /// Claim and handle one batch from `partition`. Returns how many messages were claimed.
    pub async fn poll_once(&self, partition: u32) -> ArgusResult<usize> {
        let messages = self
            .bus
            .receive(
                &self.topic,
                partition,
                self.config.batch_size,
                self.config.visibility_timeout(),
            )
            .await?;
        self.metrics
            .received
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        for message in &messages {
            match self.process(message).await {
                Disposition::Ack => self.acknowledge(message).await,
                Disposition::DeadLetterAndAck => {
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    self.acknowledge(message).await;
                }
                Disposition::Redeliver => {
                    self.metrics.redelivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        Ok(messages.len())
    }

    async fn process(&self, message: &ReceivedMessage) -> Disposition {
        let timeout = self.config.handler_timeout();
        let outcome =
            match tokio::time::timeout(timeout, self.engine.handle_message(&message.payload)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.metrics.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(ArgusError::Timeout(format!(
                        "handler exceeded {}ms",
                        timeout.as_millis()
                    )))
                }
            };

        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                warn!(
                    key = %message.key,
                    msg_id = message.msg_id,
                    read_count = message.read_count,
                    error = %e,
                    "Handler failed, leaving message for redelivery"
                );
                Disposition::Redeliver
            }
            Err(e) => {
                error!(
                    key = %message.key,
                    msg_id = message.msg_id,
                    error = %e,
                    "☠️ Unprocessable message, dead-lettering"
                );
                self.engine
                    .publisher()
                    .dead_letter_raw(message, &e.to_string())
                    .await;
                Disposition::DeadLetterAndAck
            }
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) {
        match self.bus.ack(message).await {
            Ok(()) => {
                self.metrics.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Redelivery is absorbed by idempotent handlers
                warn!(msg_id = message.msg_id, error = %e, "Acknowledge failed");
            }
        }
    }
}
