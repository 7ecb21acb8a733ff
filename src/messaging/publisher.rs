//! # Reliable Event Publisher
//!
//! Turns a batch's queued domain events into delivered bus messages.
//!
//! ## Delivery contract
//!
//! - Events are sent in order, keyed by batch id, so one batch's events share a partition
//! - Every send carries the event id as its idempotency key and is bounded by a timeout
//! - Retryable failures are retried with exponential backoff up to `max_attempts`
//! - When an event cannot be delivered it is copied to the dead-letter topic and the call
//!   fails with [`ArgusError::PermanentPublishFailure`], reporting how many leading
//!   events did go out. Nothing after the failed event is attempted, so the caller can
//!   keep the undelivered suffix queued without breaking per-batch order.

use crate::config::PublisherConfig;
use crate::domain::DomainEvent;
use crate::error::{ArgusError, ArgusResult};
use crate::messaging::{headers, EventBus, MessagingError, OutboundMessage, ReceivedMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, warn};

/// Broker acknowledgement level required before a send counts as delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    None,
    Leader,
    All,
}

impl fmt::Display for Acks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("0"),
            Self::Leader => f.write_str("1"),
            Self::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub acks: Acks,
    /// Attach an idempotency key so retried sends are not duplicated by the broker
    pub idempotent: bool,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            acks: Acks::All,
            idempotent: true,
        }
    }
}

/// What lands on the dead-letter topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    /// The original event, or the raw payload when it was not valid JSON
    pub event: Value,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub source_topic: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ReliablePublisher {
    bus: EventBus,
    topic: String,
    dead_letter_topic: String,
    config: PublisherConfig,
    producer: ProducerSettings,
}

impl ReliablePublisher {
    pub fn new(
        bus: EventBus,
        topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
            config,
            producer: ProducerSettings::default(),
        }
    }

    pub fn with_producer_settings(mut self, producer: ProducerSettings) -> Self {
        self.producer = producer;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    pub fn producer_settings(&self) -> &ProducerSettings {
        &self.producer
    }

    /// Publish `events` in order. Returns how many were delivered (all of them on `Ok`).
    pub async fn publish_events(&self, events: &[DomainEvent]) -> ArgusResult<usize> {
        for (index, event) in events.iter().enumerate() {
            if let Err(reason) = self.publish_one(event).await {
                return Err(ArgusError::PermanentPublishFailure {
                    published: index,
                    reason,
                });
            }
        }

        if !events.is_empty() {
            debug!(
                count = events.len(),
                topic = %self.topic,
                "📤 Events published"
            );
        }
        Ok(events.len())
    }

    async fn publish_one(&self, event: &DomainEvent) -> Result<(), String> {
        let payload = match event.to_wire_bytes() {
            Ok(payload) => payload,
            Err(e) => return Err(e.to_string()),
        };

        if payload.len() > self.config.max_message_bytes {
            let error = MessagingError::MessageTooLarge {
                size_bytes: payload.len(),
                limit_bytes: self.config.max_message_bytes,
            };
            warn!(
                batch_id = %event.aggregate_id(),
                event_type = event.event_type(),
                size_bytes = payload.len(),
                "Event exceeds bus message cap"
            );
            self.dead_letter_event(event, &error.to_string(), 0).await;
            return Err(error.to_string());
        }

        let message = self.build_message(event, payload);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.send_with_timeout(&self.topic, &message).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                error!(
                    batch_id = %event.aggregate_id(),
                    event_type = event.event_type(),
                    attempts = attempt,
                    error = %error,
                    "❌ Event publication failed, dead-lettering"
                );
                self.dead_letter_event(event, &error.to_string(), attempt).await;
                return Err(error.to_string());
            }

            let delay = self.config.backoff_for(attempt);
            warn!(
                batch_id = %event.aggregate_id(),
                event_type = event.event_type(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying event publication"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn build_message(&self, event: &DomainEvent, payload: Vec<u8>) -> OutboundMessage {
        let mut message = OutboundMessage::new(event.partition_key(), payload)
            .with_header(headers::EVENT_TYPE, event.event_type())
            .with_header(headers::ACKS, self.producer.acks.to_string());
        if self.producer.idempotent {
            message = message
                .with_header(headers::IDEMPOTENCY_KEY, event.event_id().to_string())
                .with_header(headers::IDEMPOTENT, "true");
        }
        message
    }

    async fn send_with_timeout(
        &self,
        topic: &str,
        message: &OutboundMessage,
    ) -> Result<(), MessagingError> {
        let timeout = self.config.send_timeout();
        match tokio::time::timeout(timeout, self.bus.send(topic, message)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(MessagingError::timeout(
                format!("send to {topic}"),
                timeout.as_millis() as u64,
            )),
        }
    }

    async fn dead_letter_event(&self, event: &DomainEvent, error: &str, attempts: u32) {
        let event_value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => Value::String(format!("unserializable event: {e}")),
        };
        let envelope = DeadLetterEnvelope {
            event: event_value,
            error: error.to_string(),
            timestamp: Utc::now(),
            source_topic: self.topic.clone(),
            attempts,
        };
        self.send_dead_letter(event.partition_key(), &envelope).await;
    }

    /// Forward a consumed message that can never be handled.
    pub async fn dead_letter_raw(&self, message: &ReceivedMessage, error: &str) {
        let event = serde_json::from_slice::<Value>(&message.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });
        let envelope = DeadLetterEnvelope {
            event,
            error: error.to_string(),
            timestamp: Utc::now(),
            source_topic: message.topic.clone(),
            attempts: message.read_count,
        };
        self.send_dead_letter(message.key.clone(), &envelope).await;
    }

    async fn send_dead_letter(&self, key: String, envelope: &DeadLetterEnvelope) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize dead-letter envelope");
                return;
            }
        };

        let message = OutboundMessage::new(key, payload);
        if let Err(e) = self
            .send_with_timeout(&self.dead_letter_topic, &message)
            .await
        {
            error!(
                dead_letter_topic = %self.dead_letter_topic,
                error = %e,
                original_error = %envelope.error,
                "❌ Dead-letter delivery failed"
            );
        }
    }
}
