//! # PGMQ Event Bus
//!
//! Maps a partitioned topic onto PostgreSQL message queues: partition `p` of topic `t`
//! is the PGMQ queue `{t}_{p}` (with `-` replaced by `_`, since queue names become table
//! names). The message key picks the partition, so per-batch ordering holds within a
//! queue.
//!
//! Each queued row is an envelope `{key, headers, body}`; rows without the envelope
//! shape (raw event JSON written by external workers) are accepted as-is, keyed by their
//! `batch_id`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::message::{partition_for, OutboundMessage, ReceivedMessage, SendReceipt};
use super::{BusService, MessagingError, MessagingResult};

#[derive(Debug, Serialize, Deserialize)]
struct PgmqEnvelope {
    key: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    /// Payload as text; UTF-8 JSON for every event this crate produces
    body: String,
}

#[derive(Debug, Clone)]
pub struct PgmqBus {
    pool: PgPool,
    partitions: u32,
}

impl PgmqBus {
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    pub fn queue_name(topic: &str, partition: u32) -> String {
        let sanitized: String = topic
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{sanitized}_{partition}")
    }

    fn decode_row(
        topic: &str,
        partition: u32,
        msg_id: i64,
        read_ct: i32,
        enqueued_at: DateTime<Utc>,
        message: Value,
    ) -> ReceivedMessage {
        let (key, headers, payload) = match serde_json::from_value::<PgmqEnvelope>(message.clone())
        {
            Ok(envelope) => (envelope.key, envelope.headers, envelope.body.into_bytes()),
            Err(_) => {
                let key = message
                    .get("batch_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (key, BTreeMap::new(), message.to_string().into_bytes())
            }
        };

        ReceivedMessage {
            topic: topic.to_string(),
            partition,
            msg_id,
            read_count: u32::try_from(read_ct).unwrap_or(0),
            enqueued_at,
            key,
            payload,
            headers,
        }
    }
}

#[async_trait]
impl BusService for PgmqBus {
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        for partition in 0..self.partitions {
            let queue = Self::queue_name(topic, partition);
            sqlx::query("SELECT pgmq.create($1)")
                .bind(&queue)
                .execute(&self.pool)
                .await
                .map_err(|e| MessagingError::queue_operation(&queue, "create", e.to_string()))?;
        }
        debug!(topic = topic, partitions = self.partitions, "PGMQ topic ensured");
        Ok(())
    }

    async fn send(&self, topic: &str, message: &OutboundMessage) -> MessagingResult<SendReceipt> {
        let partition = partition_for(&message.key, self.partitions);
        let queue = Self::queue_name(topic, partition);

        let envelope = PgmqEnvelope {
            key: message.key.clone(),
            headers: message.headers.clone(),
            body: String::from_utf8_lossy(&message.payload).into_owned(),
        };
        let body = serde_json::to_value(&envelope)?;

        let row = sqlx::query("SELECT pgmq.send($1, $2) AS msg_id")
            .bind(&queue)
            .bind(body)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    MessagingError::broker_unavailable(e.to_string())
                }
                other => MessagingError::queue_operation(&queue, "send", other.to_string()),
            })?;

        Ok(SendReceipt {
            partition,
            msg_id: row.try_get("msg_id")?,
            duplicate: false,
        })
    }

    async fn receive(
        &self,
        topic: &str,
        partition: u32,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<ReceivedMessage>> {
        let queue = Self::queue_name(topic, partition);
        let vt_seconds = i32::try_from(visibility_timeout.as_secs().max(1)).unwrap_or(i32::MAX);
        let qty = i32::try_from(max_messages).unwrap_or(i32::MAX);

        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(&queue)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MessagingError::queue_operation(&queue, "read", e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(Self::decode_row(
                    topic,
                    partition,
                    row.try_get("msg_id")?,
                    row.try_get("read_ct")?,
                    row.try_get("enqueued_at")?,
                    row.try_get("message")?,
                ))
            })
            .collect()
    }

    async fn ack(&self, message: &ReceivedMessage) -> MessagingResult<()> {
        let queue = Self::queue_name(&message.topic, message.partition);
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&queue)
            .bind(message.msg_id)
            .execute(&self.pool)
            .await
            .map_err(|e| MessagingError::queue_operation(&queue, "delete", e.to_string()))?;
        Ok(())
    }

    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn provider_name(&self) -> &'static str {
        "pgmq"
    }
}
