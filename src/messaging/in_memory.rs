//! # In-Memory Event Bus
//!
//! Thread-safe, partitioned in-memory bus for testing and development.
//!
//! ## Features
//!
//! - **Partitioning**: messages are routed by key exactly like the PGMQ provider
//! - **Visibility Timeout**: claimed messages are hidden until acked or the timeout lapses
//! - **Head-of-line delivery**: a partition never hands out a message while an older one
//!   is still in flight, so per-key ordering survives redelivery
//! - **Idempotent producer**: a repeated idempotency key is acknowledged but not stored
//! - **Failure injection**: make sends to a topic fail, once, N times or until cleared

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::message::{partition_for, OutboundMessage, ReceivedMessage, SendReceipt};
use super::{BusService, MessagingError, MessagingResult};
use crate::domain::{decode_event, DecodedEvent, DomainEvent};

#[derive(Debug, Clone)]
struct InMemoryQueuedMessage {
    id: i64,
    key: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    enqueued_at: DateTime<Utc>,
    /// When the message becomes visible again (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    receive_count: u32,
}

#[derive(Debug)]
struct InMemoryTopic {
    partitions: Vec<VecDeque<InMemoryQueuedMessage>>,
    next_id: i64,
    seen_idempotency_keys: HashSet<String>,
    /// Every accepted message in send order, kept after acks for inspection
    sent_log: Vec<OutboundMessage>,
    send_attempts: u64,
}

impl InMemoryTopic {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| VecDeque::new()).collect(),
            next_id: 1,
            seen_idempotency_keys: HashSet::new(),
            sent_log: Vec::new(),
            send_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct FailurePlan {
    /// `None` fails every send until cleared
    remaining: Option<u32>,
    error: MessagingError,
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, InMemoryTopic>,
    failures: HashMap<String, FailurePlan>,
}

#[derive(Debug, Clone)]
pub struct InMemoryBus {
    state: Arc<RwLock<BusState>>,
    partitions: u32,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryBus {
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
            partitions: partitions.max(1),
        }
    }

    /// Fail the next `count` sends to `topic` with `error`.
    pub async fn fail_next_sends(&self, topic: &str, count: u32, error: MessagingError) {
        let mut state = self.state.write().await;
        state.failures.insert(
            topic.to_string(),
            FailurePlan {
                remaining: Some(count),
                error,
            },
        );
    }

    /// Fail every send to `topic` until [`InMemoryBus::clear_failures`].
    pub async fn fail_all_sends(&self, topic: &str, error: MessagingError) {
        let mut state = self.state.write().await;
        state.failures.insert(
            topic.to_string(),
            FailurePlan {
                remaining: None,
                error,
            },
        );
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    /// Accepted messages for `topic` in send order, including acknowledged ones.
    pub async fn sent_messages(&self, topic: &str) -> Vec<OutboundMessage> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|t| t.sent_log.clone())
            .unwrap_or_default()
    }

    /// Accepted messages for `topic` decoded as domain events, in send order.
    pub async fn published_events(&self, topic: &str) -> Vec<DomainEvent> {
        self.sent_messages(topic)
            .await
            .iter()
            .filter_map(|m| match decode_event(&m.payload) {
                Ok(DecodedEvent::Known(event)) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Every send call for `topic`, including failed and de-duplicated ones.
    pub async fn send_attempts(&self, topic: &str) -> u64 {
        let state = self.state.read().await;
        state.topics.get(topic).map(|t| t.send_attempts).unwrap_or(0)
    }

    /// Messages not yet acknowledged, across all partitions.
    pub async fn pending_count(&self, topic: &str) -> usize {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    fn check_partition(&self, topic: &str, partition: u32) -> MessagingResult<()> {
        if partition >= self.partitions {
            return Err(MessagingError::queue_operation(
                topic,
                "receive",
                format!("partition {partition} out of range 0..{}", self.partitions),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BusService for InMemoryBus {
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        let mut state = self.state.write().await;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| InMemoryTopic::new(self.partitions));
        Ok(())
    }

    async fn send(&self, topic: &str, message: &OutboundMessage) -> MessagingResult<SendReceipt> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let partitions = self.partitions;
        let queue = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| InMemoryTopic::new(partitions));
        queue.send_attempts += 1;

        if let Some(plan) = state.failures.get_mut(topic) {
            let error = plan.error.clone();
            match plan.remaining.as_mut() {
                None => return Err(error),
                Some(0) => {
                    state.failures.remove(topic);
                }
                Some(remaining) => {
                    *remaining -= 1;
                    if *remaining == 0 {
                        state.failures.remove(topic);
                    }
                    return Err(error);
                }
            }
        }

        let partition = partition_for(&message.key, partitions);

        if let Some(key) = message.idempotency_key() {
            if !queue.seen_idempotency_keys.insert(key.to_string()) {
                return Ok(SendReceipt {
                    partition,
                    msg_id: 0,
                    duplicate: true,
                });
            }
        }

        let id = queue.next_id;
        queue.next_id += 1;
        queue.partitions[partition as usize].push_back(InMemoryQueuedMessage {
            id,
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            enqueued_at: Utc::now(),
            visible_at: None,
            receive_count: 0,
        });
        queue.sent_log.push(message.clone());

        Ok(SendReceipt {
            partition,
            msg_id: id,
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
        self.check_partition(topic, partition)?;

        let mut state = self.state.write().await;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let visibility = chrono::Duration::from_std(visibility_timeout).map_err(|e| {
            MessagingError::configuration("in_memory_bus", format!("visibility timeout: {e}"))
        })?;
        let mut received = Vec::new();

        for msg in queue.partitions[partition as usize].iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            let is_visible = msg.visible_at.map(|vt| vt <= now).unwrap_or(true);
            if !is_visible {
                // Older message still in flight
                break;
            }

            msg.visible_at = Some(now + visibility);
            msg.receive_count += 1;
            received.push(ReceivedMessage {
                topic: topic.to_string(),
                partition,
                msg_id: msg.id,
                read_count: msg.receive_count,
                enqueued_at: msg.enqueued_at,
                key: msg.key.clone(),
                payload: msg.payload.clone(),
                headers: msg.headers.clone(),
            });
        }

        Ok(received)
    }

    async fn ack(&self, message: &ReceivedMessage) -> MessagingResult<()> {
        self.check_partition(&message.topic, message.partition)?;

        let mut state = self.state.write().await;
        let queue = state
            .topics
            .get_mut(&message.topic)
            .ok_or_else(|| MessagingError::topic_not_found(&message.topic))?;
        let partition = &mut queue.partitions[message.partition as usize];

        if let Some(pos) = partition.iter().position(|m| m.id == message.msg_id) {
            partition.remove(pos);
        }
        Ok(())
    }

    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::headers;

    fn message(key: &str, body: &str) -> OutboundMessage {
        OutboundMessage::new(key, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_same_key_same_partition_in_order() {
        let bus = InMemoryBus::new(4);
        let first = bus.send("t", &message("batch-1", "a")).await.unwrap();
        let second = bus.send("t", &message("batch-1", "b")).await.unwrap();
        assert_eq!(first.partition, second.partition);

        let received = bus
            .receive("t", first.partition, 10, Duration::from_secs(30))
            .await
            .unwrap();
        let bodies: Vec<&[u8]> = received.iter().map(|m| m.payload.as_slice()).collect();
        assert_eq!(bodies, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivers_unacked() {
        let bus = InMemoryBus::new(1);
        bus.send("t", &message("k", "a")).await.unwrap();

        let first = bus
            .receive("t", 0, 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(bus
            .receive("t", 0, 1, Duration::from_millis(20))
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = bus
            .receive("t", 0, 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(again[0].msg_id, first[0].msg_id);
        assert_eq!(again[0].read_count, 2);

        bus.ack(&again[0]).await.unwrap();
        assert_eq!(bus.pending_count("t").await, 0);
        assert_eq!(bus.sent_messages("t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_head_blocks_partition() {
        let bus = InMemoryBus::new(1);
        bus.send("t", &message("k", "a")).await.unwrap();
        bus.send("t", &message("k", "b")).await.unwrap();

        let head = bus.receive("t", 0, 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(head[0].payload, b"a");
        assert!(bus
            .receive("t", 0, 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        bus.ack(&head[0]).await.unwrap();
        let next = bus.receive("t", 0, 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(next[0].payload, b"b");
    }

    #[tokio::test]
    async fn test_idempotency_key_dedup() {
        let bus = InMemoryBus::new(2);
        let msg = message("k", "a").with_header(headers::IDEMPOTENCY_KEY, "evt-1");

        let first = bus.send("t", &msg).await.unwrap();
        let second = bus.send("t", &msg).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(bus.pending_count("t").await, 1);
        assert_eq!(bus.send_attempts("t").await, 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let bus = InMemoryBus::new(1);
        bus.fail_next_sends("t", 2, MessagingError::broker_unavailable("down"))
            .await;

        assert!(bus.send("t", &message("k", "a")).await.is_err());
        assert!(bus.send("t", &message("k", "a")).await.is_err());
        assert!(bus.send("t", &message("k", "a")).await.is_ok());

        bus.fail_all_sends("t", MessagingError::broker_unavailable("down"))
            .await;
        for _ in 0..5 {
            assert!(bus.send("t", &message("k", "b")).await.is_err());
        }
        bus.clear_failures().await;
        assert!(bus.send("t", &message("k", "b")).await.is_ok());
        assert_eq!(bus.sent_messages("t").await.len(), 2);
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_partition() {
        let bus = InMemoryBus::new(2);
        assert!(bus
            .receive("t", 5, 1, Duration::from_secs(1))
            .await
            .is_err());
    }
}
