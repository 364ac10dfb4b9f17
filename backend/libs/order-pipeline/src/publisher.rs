//! Order publisher.
//!
//! `publish` validates the order, serializes it, keys it by customer and sends
//! it with bounded retry. Each call resolves to exactly one terminal outcome.

use crate::broker::{Delivery, OutgoingRecord, RecordProducer};
use crate::error::{BrokerError, PublishError};
use crate::observer::{NoopObserver, PipelineObserver};
use order_events::{Order, OrderId};
use resilience::{with_retry, RetryConfig, RetryError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delivery state of one publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Pending,
    Acknowledged(Delivery),
    Failed,
}

/// Envelope owned by a single publish call: the keyed record and its outcome.
#[derive(Debug)]
pub struct DeliveryRecord {
    pub record: OutgoingRecord,
    pub outcome: DeliveryOutcome,
}

impl DeliveryRecord {
    fn new(record: OutgoingRecord) -> Self {
        Self {
            record,
            outcome: DeliveryOutcome::Pending,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.record.key
    }
}

/// Confirmation of a successful publish, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub order_id: OrderId,
    pub key: String,
    pub partition: i32,
    pub offset: i64,
    pub attempts: u32,
}

pub struct OrderPublisher<P: RecordProducer> {
    producer: Arc<P>,
    topic: String,
    retry: RetryConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl<P: RecordProducer> OrderPublisher<P> {
    pub fn new(producer: Arc<P>, topic: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            producer,
            topic: topic.into(),
            retry,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one order.
    ///
    /// Fails with [`PublishError::MalformedEvent`] before anything is sent if
    /// the order breaks its invariants. Transient broker errors are retried up
    /// to the configured attempt cap; on exhaustion, or on a permanent broker
    /// error, the order is handed back in [`PublishError::PublishFailed`].
    pub async fn publish(&self, order: Order) -> Result<DeliveryReceipt, PublishError> {
        order.validate()?;
        let payload = order.to_bytes()?;

        let mut envelope = DeliveryRecord::new(OutgoingRecord::new(
            self.topic.as_str(),
            order.partition_key(),
            payload,
        ));

        let mut attempts = 0u32;
        let result = with_retry(&self.retry, || {
            attempts += 1;
            self.producer.send(&envelope.record)
        })
        .await;

        match result {
            Ok(delivery) => {
                envelope.outcome = DeliveryOutcome::Acknowledged(delivery);
                self.observer
                    .publish_acknowledged(order.order_id.as_str(), delivery.partition, delivery.offset);
                debug!(
                    order_id = %order.order_id,
                    key = %envelope.partition_key(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    attempts,
                    "Order published"
                );
                Ok(DeliveryReceipt {
                    order_id: order.order_id,
                    key: envelope.record.key,
                    partition: delivery.partition,
                    offset: delivery.offset,
                    attempts,
                })
            }
            Err(err) => {
                envelope.outcome = DeliveryOutcome::Failed;
                let (attempts, source) = match err {
                    RetryError::Exhausted { attempts, last } => (attempts, last),
                    RetryError::Permanent(e) => (attempts, e),
                };
                self.observer.publish_failed(order.order_id.as_str());
                warn!(
                    order_id = %order.order_id,
                    key = %envelope.partition_key(),
                    outcome = ?envelope.outcome,
                    attempts,
                    error = %source,
                    "Order publish failed"
                );
                Err(PublishError::PublishFailed {
                    order: Box::new(order),
                    attempts,
                    source,
                })
            }
        }
    }

    /// Wait for in-flight records. Returns how many were still undelivered at the deadline.
    pub async fn flush(&self, timeout: Duration) -> Result<usize, BrokerError> {
        let remaining = self.producer.flush(timeout).await?;
        debug!(remaining, "Producer flushed");
        Ok(remaining)
    }

    pub async fn partition_count(&self) -> Result<usize, BrokerError> {
        self.producer.partition_count(&self.topic).await
    }
}
