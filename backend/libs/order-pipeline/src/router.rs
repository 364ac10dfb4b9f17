//! Failure router.
//!
//! Records that can never succeed are copied, byte for byte, to a dead-letter
//! topic with headers describing why and where they came from. Only after the
//! dead letter is acknowledged may the consumer commit past the original.

use crate::broker::{BrokerRecord, Delivery, OutgoingRecord, RecordProducer};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use chrono::Utc;
use resilience::{with_retry, RetryConfig, RetryError};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub const HEADER_FAILURE_CLASS: &str = "x-failure-class";
pub const HEADER_FAILURE_DETAIL: &str = "x-failure-detail";
pub const HEADER_SOURCE_TOPIC: &str = "x-source-topic";
pub const HEADER_SOURCE_PARTITION: &str = "x-source-partition";
pub const HEADER_SOURCE_OFFSET: &str = "x-source-offset";
pub const HEADER_FAILED_AT: &str = "x-failed-at";
pub const HEADER_DEAD_LETTER_ID: &str = "x-dead-letter-id";

/// Why a record was diverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Payload could not be decoded.
    Malformed(String),
    /// Payload decoded but broke a business rule.
    Invalid(String),
    /// Store refused the order permanently.
    Rejected(String),
}

impl FailureReason {
    pub fn class(&self) -> &'static str {
        match self {
            FailureReason::Malformed(_) => "malformed",
            FailureReason::Invalid(_) => "invalid",
            FailureReason::Rejected(_) => "rejected",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            FailureReason::Malformed(d) | FailureReason::Invalid(d) | FailureReason::Rejected(d) => d,
        }
    }

    /// Reason for a permanent pipeline error; `None` for errors worth retrying.
    pub fn from_error(err: &PipelineError) -> Option<Self> {
        match err {
            PipelineError::MalformedEvent(e) => Some(FailureReason::Malformed(e.to_string())),
            PipelineError::InvalidEvent(e) => Some(FailureReason::Invalid(e.to_string())),
            PipelineError::StructuralPersistFailure(e) => {
                Some(FailureReason::Rejected(e.to_string()))
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait FailureRouter: Send + Sync {
    /// Divert `record` to the side channel. An error means the record was not
    /// diverted and the main offset must not advance past it.
    async fn route(&self, record: &BrokerRecord, reason: &FailureReason) -> PipelineResult<Delivery>;
}

/// Routes failures to a dead-letter topic through any [`RecordProducer`].
pub struct DeadLetterRouter<P: RecordProducer> {
    producer: Arc<P>,
    topic: String,
    retry: RetryConfig,
}

impl<P: RecordProducer> DeadLetterRouter<P> {
    pub fn new(producer: Arc<P>, topic: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            producer,
            topic: topic.into(),
            retry,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn dead_letter(&self, record: &BrokerRecord, reason: &FailureReason) -> OutgoingRecord {
        let key = record
            .key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();

        OutgoingRecord::new(self.topic.as_str(), key, record.payload_bytes().to_vec())
            .with_header(HEADER_FAILURE_CLASS, reason.class())
            .with_header(HEADER_FAILURE_DETAIL, reason.detail())
            .with_header(HEADER_SOURCE_TOPIC, record.topic.as_str())
            .with_header(HEADER_SOURCE_PARTITION, record.partition.to_string())
            .with_header(HEADER_SOURCE_OFFSET, record.offset.to_string())
            .with_header(HEADER_FAILED_AT, Utc::now().to_rfc3339())
            .with_header(HEADER_DEAD_LETTER_ID, Uuid::new_v4().to_string())
    }
}

#[async_trait]
impl<P: RecordProducer> FailureRouter for DeadLetterRouter<P> {
    async fn route(&self, record: &BrokerRecord, reason: &FailureReason) -> PipelineResult<Delivery> {
        let dead_letter = self.dead_letter(record, reason);

        match with_retry(&self.retry, || self.producer.send(&dead_letter)).await {
            Ok(delivery) => {
                info!(
                    source_partition = record.partition,
                    source_offset = record.offset,
                    dlq_topic = %self.topic,
                    dlq_partition = delivery.partition,
                    dlq_offset = delivery.offset,
                    failure_class = reason.class(),
                    "Record routed to dead-letter topic"
                );
                Ok(delivery)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(
                    source_partition = record.partition,
                    source_offset = record.offset,
                    attempts,
                    error = %last,
                    "Dead-letter topic unavailable"
                );
                Err(PipelineError::RetryExhausted {
                    stage: "route",
                    attempts,
                    last_error: last.to_string(),
                })
            }
            Err(RetryError::Permanent(e)) => Err(PipelineError::Broker(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use std::time::Duration;

    fn record() -> BrokerRecord {
        BrokerRecord {
            topic: "food-orders".to_string(),
            partition: 2,
            offset: 41,
            key: Some(b"CUST-00003".to_vec()),
            payload: Some(b"{not json".to_vec()),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_route_preserves_payload_and_tags_reason() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let router = DeadLetterRouter::new(
            broker.clone(),
            "food-orders.dlq",
            RetryConfig::new(3, Duration::from_millis(1)),
        );

        let reason = FailureReason::Malformed("expected value at line 1".to_string());
        router.route(&record(), &reason).await.unwrap();

        let dead = broker.records("food-orders.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload_bytes(), b"{not json");
        assert_eq!(dead[0].key_str(), Some("CUST-00003"));
        assert_eq!(dead[0].header(HEADER_FAILURE_CLASS), Some("malformed"));
        assert_eq!(dead[0].header(HEADER_SOURCE_PARTITION), Some("2"));
        assert_eq!(dead[0].header(HEADER_SOURCE_OFFSET), Some("41"));
        assert!(dead[0].header(HEADER_DEAD_LETTER_ID).is_some());
    }

    #[tokio::test]
    async fn test_route_exhaustion_is_error() {
        let broker = Arc::new(InMemoryBroker::new(1));
        broker.fail_next_produces(10);
        let router = DeadLetterRouter::new(
            broker.clone(),
            "food-orders.dlq",
            RetryConfig::new(2, Duration::from_millis(1)),
        );

        let reason = FailureReason::Invalid("total mismatch".to_string());
        let err = router.route(&record(), &reason).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RetryExhausted { stage: "route", attempts: 2, .. }
        ));
        assert!(broker.records("food-orders.dlq").is_empty());
    }

    #[test]
    fn test_reason_from_error() {
        let err = PipelineError::StructuralPersistFailure(crate::error::SinkError::Structural(
            "check".to_string(),
        ));
        assert_eq!(FailureReason::from_error(&err).map(|r| r.class()), Some("rejected"));

        let err = PipelineError::RetryExhausted {
            stage: "persist",
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert_eq!(FailureReason::from_error(&err), None);
    }
}
