//! Consumer loop.
//!
//! Every record moves through one state machine:
//!
//! ```text
//! Received ──decode+validate──▶ Validated ──upsert──▶ Persisted ──▶ Committed
//!    │                              │
//!    └──────── permanent ───────────┴──▶ RoutedToFailure ──▶ Committed
//!
//! persist retries exhausted / router or commit unavailable ──▶ Halted
//! ```
//!
//! All transitions happen in [`OrderConsumer::advance`]; the only arms that
//! commit are `Persisted` and `RoutedToFailure`. A halted partition is paused
//! on this instance and none of its later records are processed or committed.

use crate::broker::{BrokerRecord, RecordConsumer};
use crate::error::{PipelineError, PipelineResult};
use crate::observer::{CommitKind, NoopObserver, PipelineObserver};
use crate::router::{FailureReason, FailureRouter};
use crate::sink::{OrderSink, SourcePosition, UpsertOutcome};
use chrono::{DateTime, Utc};
use order_events::{Order, OrderId};
use resilience::{with_retry, RetryConfig, RetryError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Maximum records per poll.
    pub batch_size: usize,
    /// How long one poll waits for the first record.
    pub poll_timeout: Duration,
    /// Backoff policy for transient store failures.
    pub persist_retry: RetryConfig,
    /// Backoff policy for transient offset-commit failures.
    pub commit_retry: RetryConfig,
    /// How far `created_at` may run ahead of the local clock.
    pub clock_skew: chrono::Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_timeout: Duration::from_millis(1000),
            persist_retry: RetryConfig::default(),
            commit_retry: RetryConfig::new(3, Duration::from_millis(200)),
            clock_skew: chrono::Duration::seconds(5),
        }
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(PipelineError::Config("poll_timeout must be positive".into()));
        }
        if self.clock_skew < chrono::Duration::zero() {
            return Err(PipelineError::Config("clock_skew must not be negative".into()));
        }
        Ok(())
    }
}

/// Per-instance counters, reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub conflicting_duplicates: u64,
    pub routed: u64,
    pub halted_partitions: u64,
    /// Records fetched for an already halted partition and left uncommitted.
    pub skipped: u64,
}

impl ConsumerStats {
    pub fn committed(&self) -> u64 {
        self.inserted + self.duplicates + self.conflicting_duplicates + self.routed
    }
}

/// Lifecycle of a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Received,
    Validated {
        order: Box<Order>,
        processed_at: DateTime<Utc>,
    },
    Persisted {
        order_id: OrderId,
        outcome: UpsertOutcome,
    },
    RoutedToFailure {
        reason: FailureReason,
    },
    Committed {
        kind: CommitKind,
    },
    Halted {
        reason: String,
    },
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Committed { .. } | RecordState::Halted { .. })
    }
}

pub struct OrderConsumer<C: RecordConsumer, S: OrderSink, R: FailureRouter> {
    consumer: Arc<C>,
    sink: Arc<S>,
    router: Arc<R>,
    observer: Arc<dyn PipelineObserver>,
    settings: ConsumerSettings,
    halted: HashSet<(String, i32)>,
    stats: ConsumerStats,
}

impl<C: RecordConsumer, S: OrderSink, R: FailureRouter> OrderConsumer<C, S, R> {
    pub fn new(
        consumer: Arc<C>,
        sink: Arc<S>,
        router: Arc<R>,
        settings: ConsumerSettings,
    ) -> PipelineResult<Self> {
        settings.validate()?;
        Ok(Self {
            consumer,
            sink,
            router,
            observer: Arc::new(NoopObserver),
            settings,
            halted: HashSet::new(),
            stats: ConsumerStats::default(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn is_halted(&self, topic: &str, partition: i32) -> bool {
        self.halted.contains(&(topic.to_string(), partition))
    }

    /// Poll and process until `shutdown` flips to `true`, then release the
    /// broker and store connections.
    ///
    /// Shutdown is observed between records: the record in flight finishes its
    /// commit, the rest of the batch stays uncommitted for redelivery. Returns
    /// an error only for fatal broker failures.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> PipelineResult<ConsumerStats> {
        info!(
            batch_size = self.settings.batch_size,
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            max_attempts = self.settings.persist_retry.max_attempts,
            "Order consumer starting"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let polled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                    }
                    break Ok(());
                }
                polled = self.consumer.poll_batch(self.settings.batch_size, self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(records) => self.process_batch(records, Some(&shutdown)).await,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal broker error, stopping consumer");
                    break Err(PipelineError::Broker(e));
                }
                Err(e) => {
                    warn!(error = %e, "Poll failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                    }
                }
            }
        };

        self.consumer.close().await;
        self.sink.close().await;

        let stats = self.stats;
        info!(
            received = stats.received,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            conflicting_duplicates = stats.conflicting_duplicates,
            routed = stats.routed,
            halted_partitions = stats.halted_partitions,
            skipped = stats.skipped,
            "Order consumer stopped"
        );
        result.map(|_| stats)
    }

    /// Poll one batch and process it completely. Returns the number of records fetched.
    pub async fn poll_once(&mut self) -> PipelineResult<usize> {
        let records = self
            .consumer
            .poll_batch(self.settings.batch_size, self.settings.poll_timeout)
            .await?;
        let count = records.len();
        self.process_batch(records, None).await;
        Ok(count)
    }

    async fn process_batch(
        &mut self,
        records: Vec<BrokerRecord>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) {
        for record in records {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                debug!("Shutdown requested, leaving rest of batch uncommitted");
                return;
            }
            self.stats.received += 1;

            if self.is_halted(&record.topic, record.partition) {
                self.stats.skipped += 1;
                continue;
            }

            let span = info_span!(
                "order_record",
                partition = record.partition,
                offset = record.offset,
                order_id = field::Empty,
            );
            self.process_record(&record).instrument(span).await;
        }
    }

    /// Drive one record to a terminal state.
    pub async fn process_record(&mut self, record: &BrokerRecord) -> RecordState {
        let mut state = RecordState::Received;
        while !state.is_terminal() {
            state = self.advance(record, state).await;
        }
        state
    }

    /// The single transition function of the record state machine.
    async fn advance(&mut self, record: &BrokerRecord, state: RecordState) -> RecordState {
        match state {
            RecordState::Received => match self.decode(record) {
                Ok((order, processed_at)) => RecordState::Validated {
                    order: Box::new(order),
                    processed_at,
                },
                Err(err) => self.divert(record, err).await,
            },
            RecordState::Validated {
                order,
                processed_at,
            } => match self.persist(record, &order, processed_at).await {
                Ok(outcome) => RecordState::Persisted {
                    order_id: order.order_id,
                    outcome,
                },
                Err(err) if err.is_permanent() => self.divert(record, err).await,
                Err(err) => self.halt(record, err.to_string()).await,
            },
            RecordState::Persisted { order_id, outcome } => {
                let kind = match outcome {
                    UpsertOutcome::Inserted => CommitKind::Inserted,
                    UpsertOutcome::Duplicate => CommitKind::Duplicate,
                    UpsertOutcome::ConflictingDuplicate => {
                        warn!(order_id = %order_id, "Duplicate order id with different payload");
                        self.observer.duplicate_conflict(order_id.as_str());
                        CommitKind::ConflictingDuplicate
                    }
                };
                self.commit(record, kind).await
            }
            RecordState::RoutedToFailure { .. } => self.commit(record, CommitKind::Routed).await,
            terminal @ (RecordState::Committed { .. } | RecordState::Halted { .. }) => terminal,
        }
    }

    fn decode(&self, record: &BrokerRecord) -> PipelineResult<(Order, DateTime<Utc>)> {
        let order = Order::from_bytes(record.payload_bytes())?;
        Span::current().record("order_id", order.order_id.as_str());

        order.validate()?;
        if record.key_str() != Some(order.partition_key()) {
            debug!(
                key = ?record.key_str(),
                customer_id = %order.customer_id,
                "Record key differs from customer_id"
            );
        }
        let processed_at = order.processing_time(Utc::now(), self.settings.clock_skew)?;
        debug!(customer_id = %order.customer_id, "Order validated");
        Ok((order, processed_at))
    }

    async fn persist(
        &self,
        record: &BrokerRecord,
        order: &Order,
        processed_at: DateTime<Utc>,
    ) -> PipelineResult<UpsertOutcome> {
        let source = SourcePosition {
            partition: record.partition,
            offset: record.offset,
        };

        match with_retry(&self.settings.persist_retry, || {
            self.sink.upsert(order, processed_at, source)
        })
        .await
        {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Order persisted");
                Ok(outcome)
            }
            Err(RetryError::Permanent(e)) => Err(e.into()),
            Err(RetryError::Exhausted { attempts, last }) => Err(PipelineError::RetryExhausted {
                stage: "persist",
                attempts,
                last_error: last.to_string(),
            }),
        }
    }

    async fn divert(&mut self, record: &BrokerRecord, err: PipelineError) -> RecordState {
        let Some(reason) = FailureReason::from_error(&err) else {
            return self.halt(record, err.to_string()).await;
        };
        warn!(
            failure_class = reason.class(),
            error = %err,
            "Permanent failure, routing record to dead-letter topic"
        );

        match self.router.route(record, &reason).await {
            Ok(_) => {
                self.observer
                    .record_routed(record.partition, record.offset, reason.class());
                RecordState::RoutedToFailure { reason }
            }
            Err(route_err) => {
                self.halt(record, format!("dead-letter routing failed: {}", route_err))
                    .await
            }
        }
    }

    async fn commit(&mut self, record: &BrokerRecord, kind: CommitKind) -> RecordState {
        let next_offset = record.offset + 1;
        let result = with_retry(&self.settings.commit_retry, || {
            self.consumer
                .commit(&record.topic, record.partition, next_offset)
        })
        .await;

        match result {
            Ok(()) => {
                match kind {
                    CommitKind::Inserted => self.stats.inserted += 1,
                    CommitKind::Duplicate => self.stats.duplicates += 1,
                    CommitKind::ConflictingDuplicate => self.stats.conflicting_duplicates += 1,
                    CommitKind::Routed => self.stats.routed += 1,
                }
                self.observer
                    .record_committed(record.partition, record.offset, kind);
                debug!(next_offset, kind = kind.as_str(), "Offset committed");
                RecordState::Committed { kind }
            }
            Err(e) => {
                let e = e.into_inner();
                self.halt(record, format!("offset commit failed: {}", e)).await
            }
        }
    }

    async fn halt(&mut self, record: &BrokerRecord, reason: String) -> RecordState {
        if let Err(e) = self
            .consumer
            .halt_partition(&record.topic, record.partition)
            .await
        {
            warn!(error = %e, "Failed to pause partition; later records are still skipped");
        }

        if self.halted.insert((record.topic.clone(), record.partition)) {
            self.stats.halted_partitions += 1;
        }
        self.observer
            .partition_halted(&record.topic, record.partition, &reason);
        error!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            reason = %reason,
            "Partition halted, offsets will not advance until operator intervention"
        );
        RecordState::Halted { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{InMemoryBroker, InMemoryConsumer};
    use crate::broker::{OutgoingRecord, RecordProducer};
    use crate::error::BrokerError;
    use crate::router::DeadLetterRouter;
    use crate::sink::memory::InMemoryOrderSink;
    use order_events::{LineItem, Money};

    const TOPIC: &str = "food-orders";
    const DLQ: &str = "food-orders.dlq";

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            batch_size: 10,
            poll_timeout: Duration::from_millis(5),
            persist_retry: RetryConfig::new(3, Duration::from_millis(1)),
            commit_retry: RetryConfig::new(2, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    fn order(seq: u32) -> Order {
        Order::new(
            OrderId::generate(Utc::now().date_naive(), seq),
            "CUST-00001",
            "Jane Doe",
            "jane@example.com",
            vec![LineItem::new("ITEM-001", "Classic Burger", 2, Money::from_cents(899)).unwrap()],
            Utc::now(),
        )
        .unwrap()
    }

    type TestConsumer =
        OrderConsumer<InMemoryConsumer, InMemoryOrderSink, DeadLetterRouter<InMemoryBroker>>;

    fn setup() -> (InMemoryBroker, Arc<InMemoryOrderSink>, TestConsumer) {
        let broker = InMemoryBroker::new(1);
        let sink = Arc::new(InMemoryOrderSink::new());
        let router = Arc::new(DeadLetterRouter::new(
            Arc::new(broker.clone()),
            DLQ,
            RetryConfig::new(2, Duration::from_millis(1)),
        ));
        let consumer = OrderConsumer::new(
            Arc::new(broker.consumer("order-processors", TOPIC)),
            sink.clone(),
            router,
            settings(),
        )
        .unwrap();
        (broker, sink, consumer)
    }

    async fn send_raw(broker: &InMemoryBroker, payload: &[u8]) {
        broker
            .send(&OutgoingRecord::new(TOPIC, "CUST-00001", payload.to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_valid_record_persisted_then_committed() {
        let (broker, sink, mut consumer) = setup();
        let order = order(1);
        send_raw(&broker, &order.to_bytes().unwrap()).await;

        assert_eq!(consumer.poll_once().await.unwrap(), 1);

        assert_eq!(sink.len(), 1);
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), Some(1));
        assert_eq!(consumer.stats().inserted, 1);
    }

    #[tokio::test]
    async fn test_state_sequence_for_duplicate() {
        let (broker, sink, mut consumer) = setup();
        let order = order(1);
        send_raw(&broker, &order.to_bytes().unwrap()).await;
        send_raw(&broker, &order.to_bytes().unwrap()).await;

        consumer.poll_once().await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(consumer.stats().inserted, 1);
        assert_eq!(consumer.stats().duplicates, 1);
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), Some(2));
    }

    #[tokio::test]
    async fn test_empty_payload_routed() {
        let (broker, sink, mut consumer) = setup();
        send_raw(&broker, b"").await;

        consumer.poll_once().await.unwrap();

        assert!(sink.is_empty());
        let dead = broker.records(DLQ);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header("x-failure-class"), Some("malformed"));
        assert_eq!(consumer.stats().routed, 1);
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn test_future_created_at_is_invalid() {
        let (broker, sink, mut consumer) = setup();
        let mut order = order(1);
        order.created_at = Utc::now() + chrono::Duration::hours(2);
        send_raw(&broker, &order.to_bytes().unwrap()).await;

        consumer.poll_once().await.unwrap();

        assert!(sink.is_empty());
        assert_eq!(broker.records(DLQ)[0].header("x-failure-class"), Some("invalid"));
    }

    #[tokio::test]
    async fn test_structural_rejection_routed() {
        let (broker, sink, mut consumer) = setup();
        let order = order(1);
        sink.reject(&order.order_id);
        send_raw(&broker, &order.to_bytes().unwrap()).await;

        consumer.poll_once().await.unwrap();

        assert_eq!(sink.attempts(), 1);
        assert_eq!(broker.records(DLQ)[0].header("x-failure-class"), Some("rejected"));
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn test_persist_exhaustion_halts_partition() {
        let (broker, sink, mut consumer) = setup();
        sink.fail_next(10);
        send_raw(&broker, &order(1).to_bytes().unwrap()).await;
        send_raw(&broker, &order(2).to_bytes().unwrap()).await;

        consumer.poll_once().await.unwrap();

        assert!(consumer.is_halted(TOPIC, 0));
        assert_eq!(sink.attempts(), 3);
        assert_eq!(consumer.stats().halted_partitions, 1);
        assert_eq!(consumer.stats().skipped, 1);
        assert_eq!(broker.commit_count(), 0);
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), None);
    }

    #[tokio::test]
    async fn test_dead_letter_unavailable_halts_partition() {
        let (broker, _sink, mut consumer) = setup();
        send_raw(&broker, b"garbage").await;
        broker.fail_next_produces(5);

        consumer.poll_once().await.unwrap();

        assert!(consumer.is_halted(TOPIC, 0));
        assert_eq!(broker.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (broker, sink, mut consumer) = setup();
        send_raw(&broker, &order(1).to_bytes().unwrap()).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        for _ in 0..100 {
            if sink.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.inserted, 1);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_fatal_poll_error_stops_run_and_releases_resources() {
        let (broker, sink, mut consumer) = setup();
        broker.fail_next_poll(BrokerError::Fatal("group authorization failed".to_string()));

        let (_tx, rx) = watch::channel(false);
        let result = consumer.run(rx).await;

        assert!(matches!(
            result,
            Err(PipelineError::Broker(BrokerError::Fatal(_)))
        ));
        assert!(sink.is_closed());
        // The member left the group, so a new one gets every partition
        let next = broker.consumer("order-processors", TOPIC);
        assert_eq!(next.assignment(), vec![0]);
    }

    #[tokio::test]
    async fn test_shutdown_during_poll_backoff() {
        let (broker, _sink, consumer) = setup();
        let mut consumer = OrderConsumer {
            settings: ConsumerSettings {
                poll_timeout: Duration::from_secs(30),
                ..settings()
            },
            ..consumer
        };
        broker.fail_next_poll(BrokerError::Transient("broker transport failure".to_string()));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer ignored shutdown while backing off")
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 0);
    }

    #[derive(Default)]
    struct ConflictCounter(std::sync::atomic::AtomicUsize);

    impl PipelineObserver for ConflictCounter {
        fn duplicate_conflict(&self, _order_id: &str) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_conflicting_duplicate_is_committed_and_reported() {
        let broker = InMemoryBroker::new(1);
        let sink = Arc::new(InMemoryOrderSink::new().strict());
        let observer = Arc::new(ConflictCounter::default());
        let router = Arc::new(DeadLetterRouter::new(
            Arc::new(broker.clone()),
            DLQ,
            RetryConfig::new(2, Duration::from_millis(1)),
        ));
        let mut consumer = OrderConsumer::new(
            Arc::new(broker.consumer("order-processors", TOPIC)),
            sink.clone(),
            router,
            settings(),
        )
        .unwrap()
        .with_observer(observer.clone());

        let original = order(1);
        let mut changed = original.clone();
        changed.customer_name = "John Roe".to_string();
        send_raw(&broker, &original.to_bytes().unwrap()).await;
        send_raw(&broker, &changed.to_bytes().unwrap()).await;

        consumer.poll_once().await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get(&original.order_id).unwrap().order.customer_name, "Jane Doe");
        assert_eq!(consumer.stats().inserted, 1);
        assert_eq!(consumer.stats().conflicting_duplicates, 1);
        assert_eq!(observer.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(broker.records(DLQ).is_empty());
        assert_eq!(broker.committed_offset("order-processors", TOPIC, 0), Some(2));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = settings();
        settings.batch_size = 0;
        assert!(matches!(settings.validate(), Err(PipelineError::Config(_))));
    }
}
