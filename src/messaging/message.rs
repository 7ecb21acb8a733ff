//! Bus message types shared by every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known header names
pub mod headers {
    /// Producer-assigned key the broker uses to drop duplicate sends
    pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
    pub const EVENT_TYPE: &str = "event-type";
    pub const ACKS: &str = "acks";
    pub const IDEMPOTENT: &str = "idempotent";
}

/// A message ready to be sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Partition key; all messages with the same key land in the same partition
    pub key: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(headers::IDEMPOTENCY_KEY).map(String::as_str)
    }
}

/// Where a sent message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub partition: u32,
    pub msg_id: i64,
    /// The broker already had a message with this idempotency key
    pub duplicate: bool,
}

/// A message claimed by a consumer; invisible to others until acked or the visibility
/// timeout lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub partition: u32,
    pub msg_id: i64,
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Stable partition assignment (32-bit FNV-1a of the key).
///
/// Must not depend on process-local hasher seeds: every producer instance has to agree.
pub fn partition_for(key: &str, partition_count: u32) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    if partition_count <= 1 {
        return 0;
    }
    let hash = key.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        let key = "6f1c3a52-8a1e-4c1b-9a51-6b3f0f6f1d2e";
        let first = partition_for(key, 8);
        for _ in 0..10 {
            assert_eq!(partition_for(key, 8), first);
        }
        assert!(first < 8);
        assert_eq!(partition_for(key, 1), 0);
        assert_eq!(partition_for(key, 0), 0);
    }

    #[test]
    fn test_fnv_reference_value() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(partition_for("a", u32::MAX), 0xe40c_292c % u32::MAX);
    }

    #[test]
    fn test_headers() {
        let message = OutboundMessage::new("k", b"{}".to_vec())
            .with_header(headers::IDEMPOTENCY_KEY, "evt-1");
        assert_eq!(message.idempotency_key(), Some("evt-1"));
    }
}
