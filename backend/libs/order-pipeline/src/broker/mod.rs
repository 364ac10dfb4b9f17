//! Broker boundary.
//!
//! The pipeline talks to the partitioned log only through [`RecordProducer`]
//! and [`RecordConsumer`]. The Kafka implementations live in [`kafka`]; the
//! in-memory broker in [`memory`] backs the test suite and local runs.

pub mod kafka;
pub mod memory;

use crate::error::BrokerError;
use async_trait::async_trait;
use std::time::Duration;

/// Broker acknowledgment of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Record handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Record pulled from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    /// Broker timestamp in milliseconds since the epoch.
    pub timestamp: Option<i64>,
}

impl BrokerRecord {
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Producing side of the broker.
///
/// `send` resolves exactly once per call, after the broker acknowledged the
/// record on all in-sync replicas or gave up.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    async fn send(&self, record: &OutgoingRecord) -> Result<Delivery, BrokerError>;

    /// Wait until queued records are delivered. Returns the number still in flight.
    async fn flush(&self, timeout: Duration) -> Result<usize, BrokerError>;

    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError>;
}

/// Consuming side of the broker, one consumer-group member.
///
/// Offsets are committed explicitly and only through [`RecordConsumer::commit`].
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// Fetch up to `max_records`, waiting at most `timeout` for the first one.
    async fn poll_batch(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Mark everything before `next_offset` on the partition as processed.
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64)
        -> Result<(), BrokerError>;

    /// Stop fetching from a partition on this member.
    async fn halt_partition(&self, topic: &str, partition: i32) -> Result<(), BrokerError>;

    /// Leave the group and release the connection.
    async fn close(&self);
}

/// Stable partition selection used by the in-memory broker.
///
/// FNV-1a over the key bytes, modulo the partition count.
pub fn partition_for(key: &str, partitions: usize) -> i32 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    if partitions == 0 {
        return 0;
    }
    let hash = key.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash % partitions as u64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_is_stable() {
        let first = partition_for("CUST-00042", 3);
        for _ in 0..10 {
            assert_eq!(partition_for("CUST-00042", 3), first);
        }
        assert!((0..3).contains(&first));
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let mut used = std::collections::HashSet::new();
        for i in 0..50 {
            used.insert(partition_for(&format!("CUST-{:05}", i), 3));
        }
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn test_record_accessors() {
        let record = BrokerRecord {
            topic: "food-orders".to_string(),
            partition: 1,
            offset: 7,
            key: Some(b"CUST-00001".to_vec()),
            payload: None,
            headers: vec![("x-failure-class".to_string(), "malformed".to_string())],
            timestamp: None,
        };
        assert_eq!(record.key_str(), Some("CUST-00001"));
        assert!(record.payload_bytes().is_empty());
        assert_eq!(record.header("x-failure-class"), Some("malformed"));
        assert_eq!(record.header("missing"), None);
    }
}
