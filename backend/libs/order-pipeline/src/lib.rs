//! # Order Pipeline
//!
//! At-least-once delivery of food orders from a generator to PostgreSQL through
//! a partitioned Kafka topic.
//!
//! ## Architecture
//!
//! ```text
//! Order ─▶ OrderPublisher ─▶ Kafka (key = customer_id)
//!                              │
//!                              ▼
//!                        OrderConsumer ── decode/validate ──▶ OrderSink (ON CONFLICT DO NOTHING)
//!                              │                                   │
//!                              └─ permanent failure ─▶ FailureRouter (dead-letter topic)
//!                                                                  │
//!                                       commit offset + 1 ◀────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Publish**: idempotent producer, `acks=all`, bounded retry; exhaustion
//!   hands the order back to the caller.
//! - **Consume**: offsets are committed only after the sink wrote the order
//!   (or found it already stored) or the failure router acknowledged the
//!   dead letter. Redelivered orders collapse into the existing row.
//! - **Ordering**: records are processed sequentially per consumer instance,
//!   so orders of one customer reach the store in publish order.
//! - **Halting**: when store retries are exhausted the partition stops
//!   advancing on this instance instead of skipping the record.
//!
//! ## Usage Example
//!
//! ```ignore
//! use order_pipeline::{
//!     broker::memory::InMemoryBroker, sink::memory::InMemoryOrderSink, ConsumerSettings,
//!     DeadLetterRouter, OrderConsumer, OrderPublisher,
//! };
//! use resilience::RetryConfig;
//! use std::sync::Arc;
//!
//! # async fn example(order: order_events::Order) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new(3));
//! let publisher = OrderPublisher::new(broker.clone(), "food-orders", RetryConfig::default());
//! publisher.publish(order).await?;
//!
//! let router = DeadLetterRouter::new(broker.clone(), "food-orders.dlq", RetryConfig::default());
//! let mut consumer = OrderConsumer::new(
//!     Arc::new(broker.consumer("order-processors", "food-orders")),
//!     Arc::new(InMemoryOrderSink::new()),
//!     Arc::new(router),
//!     ConsumerSettings::default(),
//! )?;
//! consumer.poll_once().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod consumer;
pub mod error;
pub mod observer;
pub mod publisher;
pub mod router;
pub mod sink;
pub mod telemetry;

pub use broker::{BrokerRecord, Delivery, OutgoingRecord, RecordConsumer, RecordProducer};
pub use consumer::{ConsumerSettings, ConsumerStats, OrderConsumer, RecordState};
pub use error::{BrokerError, PipelineError, PipelineResult, PublishError, SinkError};
pub use observer::{
    encode_metrics, log_metrics_snapshot, CommitKind, NoopObserver, PipelineMetrics,
    PipelineObserver,
};
pub use publisher::{DeliveryOutcome, DeliveryReceipt, DeliveryRecord, OrderPublisher};
pub use router::{DeadLetterRouter, FailureReason, FailureRouter};
pub use sink::{OrderSink, SourcePosition, UpsertOutcome};
