//! Rate-limited publish loop.
//!
//! Each generated order is published by its own task so a slow acknowledgment
//! never holds back the generation rate. On shutdown or when the run duration
//! ends, generation stops, every in-flight publish is awaited and the producer
//! is flushed.

use crate::generator::OrderGenerator;
use order_pipeline::{DeliveryReceipt, OrderPublisher, PublishError, RecordProducer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

pub const PROGRESS_EVERY: u64 = 100;
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

type PublishOutcome = Result<DeliveryReceipt, PublishError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub generated: u64,
    pub published: u64,
    pub failed: u64,
    /// Records still undelivered when the final flush gave up
    pub unflushed: usize,
}

impl PublishSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.unflushed == 0
    }
}

pub struct PublishLoop<P: RecordProducer + 'static> {
    publisher: Arc<OrderPublisher<P>>,
    generator: OrderGenerator,
    interval: Duration,
    duration: Option<Duration>,
}

impl<P: RecordProducer + 'static> PublishLoop<P> {
    pub fn new(
        publisher: Arc<OrderPublisher<P>>,
        generator: OrderGenerator,
        interval: Duration,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            publisher,
            generator,
            interval: interval.max(Duration::from_millis(1)),
            duration,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PublishSummary {
        let started = Instant::now();
        let mut summary = PublishSummary::default();
        let mut tasks: JoinSet<PublishOutcome> = JoinSet::new();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let duration = self.duration;
        let deadline = async move {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        info!(
            topic = %self.publisher.topic(),
            interval_ms = self.interval.as_millis() as u64,
            duration_secs = ?self.duration.map(|d| d.as_secs()),
            "Publishing orders"
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping generation");
                break;
            }

            tokio::select! {
                _ = &mut deadline => {
                    info!("Run duration reached, stopping generation");
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record(&mut summary, joined);
                }
                _ = ticker.tick() => {
                    match self.generator.next_order() {
                        Ok(order) => {
                            summary.generated += 1;
                            let publisher = self.publisher.clone();
                            tasks.spawn(async move { publisher.publish(order).await }.in_current_span());
                        }
                        Err(e) => {
                            summary.failed += 1;
                            error!(error = %e, "Generated order failed validation");
                        }
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight publishes");
        while let Some(joined) = tasks.join_next().await {
            record(&mut summary, joined);
        }

        match self.publisher.flush(FLUSH_TIMEOUT).await {
            Ok(remaining) => summary.unflushed = remaining,
            Err(e) => warn!(error = %e, "Final flush failed"),
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            generated = summary.generated,
            published = summary.published,
            failed = summary.failed,
            unflushed = summary.unflushed,
            elapsed_secs = elapsed,
            orders_per_sec = if elapsed > 0.0 { summary.published as f64 / elapsed } else { 0.0 },
            "Producer finished"
        );
        summary
    }
}

fn record(summary: &mut PublishSummary, joined: Result<PublishOutcome, JoinError>) {
    match joined {
        Ok(Ok(receipt)) => {
            summary.published += 1;
            debug!(order_id = %receipt.order_id, partition = receipt.partition, "Publish confirmed");
            if summary.published % PROGRESS_EVERY == 0 {
                info!(
                    published = summary.published,
                    failed = summary.failed,
                    "Publish progress"
                );
            }
        }
        // Logged and dropped; the summary reports the failure count
        Ok(Err(e)) => {
            summary.failed += 1;
            error!(error = %e, "Order dropped after publish failure");
        }
        Err(e) => {
            summary.failed += 1;
            error!(error = %e, "Publish task did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_pipeline::broker::memory::InMemoryBroker;
    use resilience::RetryConfig;

    fn publisher(broker: &InMemoryBroker, attempts: u32) -> Arc<OrderPublisher<InMemoryBroker>> {
        Arc::new(OrderPublisher::new(
            Arc::new(broker.clone()),
            "food-orders",
            RetryConfig::new(attempts, Duration::from_millis(1)),
        ))
    }

    #[tokio::test]
    async fn test_runs_for_duration_and_publishes_everything() {
        let broker = InMemoryBroker::new(3);
        let (_tx, rx) = watch::channel(false);

        let summary = PublishLoop::new(
            publisher(&broker, 3),
            OrderGenerator::new(42),
            Duration::from_millis(5),
            Some(Duration::from_millis(60)),
        )
        .run(rx)
        .await;

        assert!(summary.generated > 0);
        assert_eq!(summary.published, summary.generated);
        assert!(summary.is_clean());
        assert_eq!(broker.records("food-orders").len() as u64, summary.published);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_publishes_nothing() {
        let broker = InMemoryBroker::new(1);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = PublishLoop::new(
            publisher(&broker, 3),
            OrderGenerator::new(42),
            Duration::from_millis(5),
            None,
        )
        .run(rx)
        .await;

        assert_eq!(summary, PublishSummary::default());
        assert!(broker.records("food-orders").is_empty());
    }

    #[tokio::test]
    async fn test_failed_publishes_are_counted() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_produces(u32::MAX);
        let (_tx, rx) = watch::channel(false);

        let summary = PublishLoop::new(
            publisher(&broker, 1),
            OrderGenerator::new(42),
            Duration::from_millis(5),
            Some(Duration::from_millis(30)),
        )
        .run(rx)
        .await;

        assert!(summary.generated > 0);
        assert_eq!(summary.failed, summary.generated);
        assert_eq!(summary.published, 0);
        assert!(!summary.is_clean());
    }
}
