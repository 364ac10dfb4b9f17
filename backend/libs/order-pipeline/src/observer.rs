//! Pipeline observation hooks.
//!
//! Components report lifecycle events through an injected
//! [`PipelineObserver`]; [`PipelineMetrics`] turns them into Prometheus
//! counters registered in the default registry.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};
use tracing::{info, warn};

/// How a record reached its commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Inserted,
    Duplicate,
    ConflictingDuplicate,
    Routed,
}

impl CommitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitKind::Inserted => "inserted",
            CommitKind::Duplicate => "duplicate",
            CommitKind::ConflictingDuplicate => "conflicting_duplicate",
            CommitKind::Routed => "routed",
        }
    }
}

pub trait PipelineObserver: Send + Sync {
    fn publish_acknowledged(&self, _order_id: &str, _partition: i32, _offset: i64) {}

    fn publish_failed(&self, _order_id: &str) {}

    fn record_committed(&self, _partition: i32, _offset: i64, _kind: CommitKind) {}

    /// `class` is the failure classification sent with the dead letter.
    fn record_routed(&self, _partition: i32, _offset: i64, _class: &str) {}

    fn partition_halted(&self, _topic: &str, _partition: i32, _reason: &str) {}

    fn duplicate_conflict(&self, _order_id: &str) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

#[derive(Clone)]
pub struct PipelineMetrics {
    pub published: IntCounter,
    pub publish_failed: IntCounter,
    pub committed: IntCounterVec,
    pub routed: IntCounterVec,
    pub partitions_halted: IntCounter,
    pub duplicate_conflicts: IntCounter,
}

impl PipelineMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let published = IntCounter::with_opts(
            Opts::new(
                "orders_published_total",
                "Orders acknowledged by the broker",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for orders_published_total");

        let publish_failed = IntCounter::with_opts(
            Opts::new(
                "orders_publish_failed_total",
                "Orders the broker never acknowledged",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for orders_publish_failed_total");

        let committed = IntCounterVec::new(
            Opts::new(
                "orders_committed_total",
                "Offsets committed after persistence or routing",
            )
            .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for orders_committed_total");

        let routed = IntCounterVec::new(
            Opts::new(
                "orders_routed_total",
                "Records diverted to the dead-letter topic",
            )
            .const_label("service", service.to_string()),
            &["reason"],
        )
        .expect("valid metric opts for orders_routed_total");

        let partitions_halted = IntCounter::with_opts(
            Opts::new(
                "partitions_halted_total",
                "Partitions whose offset advancement stopped",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for partitions_halted_total");

        let duplicate_conflicts = IntCounter::with_opts(
            Opts::new(
                "orders_duplicate_conflicts_total",
                "Redelivered order ids whose payload differs from the stored row",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for orders_duplicate_conflicts_total");

        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(publish_failed.clone()),
            Box::new(committed.clone()),
            Box::new(routed.clone()),
            Box::new(partitions_halted.clone()),
            Box::new(duplicate_conflicts.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register pipeline metric: {}", e);
            }
        }

        Self {
            published,
            publish_failed,
            committed,
            routed,
            partitions_halted,
            duplicate_conflicts,
        }
    }
}

/// Every metric in the default registry, in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Log the current metric values. The services expose no scrape endpoint, so
/// this is how the counters leave the process.
pub fn log_metrics_snapshot() {
    match encode_metrics() {
        Ok(text) => info!(metrics = %text, "Metrics snapshot"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
}

impl PipelineObserver for PipelineMetrics {
    fn publish_acknowledged(&self, _order_id: &str, _partition: i32, _offset: i64) {
        self.published.inc();
    }

    fn publish_failed(&self, _order_id: &str) {
        self.publish_failed.inc();
    }

    fn record_committed(&self, _partition: i32, _offset: i64, kind: CommitKind) {
        self.committed.with_label_values(&[kind.as_str()]).inc();
    }

    fn record_routed(&self, _partition: i32, _offset: i64, class: &str) {
        self.routed.with_label_values(&[class]).inc();
    }

    fn partition_halted(&self, _topic: &str, _partition: i32, _reason: &str) {
        self.partitions_halted.inc();
    }

    fn duplicate_conflict(&self, _order_id: &str) {
        self.duplicate_conflicts.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_count_events() {
        let metrics = PipelineMetrics::new("observer-test");

        metrics.publish_acknowledged("ORD-1", 0, 0);
        metrics.record_committed(0, 0, CommitKind::Inserted);
        metrics.record_committed(0, 1, CommitKind::Duplicate);
        metrics.record_routed(1, 4, "malformed");
        metrics.partition_halted("food-orders", 2, "persist retries exhausted");

        assert_eq!(metrics.published.get(), 1);
        assert_eq!(metrics.committed.with_label_values(&["inserted"]).get(), 1);
        assert_eq!(metrics.committed.with_label_values(&["duplicate"]).get(), 1);
        assert_eq!(metrics.routed.with_label_values(&["malformed"]).get(), 1);
        assert_eq!(metrics.partitions_halted.get(), 1);
    }

    #[test]
    fn test_encode_metrics_includes_pipeline_counters() {
        let metrics = PipelineMetrics::new("snapshot-test");
        metrics.publish_acknowledged("ORD-1", 0, 0);
        metrics.record_routed(0, 1, "invalid");

        let text = encode_metrics().unwrap();
        assert!(text.contains("# TYPE orders_published_total counter"));
        assert!(text.contains(r#"orders_published_total{service="snapshot-test"} 1"#));
        assert!(text.contains(r#"orders_routed_total{reason="invalid",service="snapshot-test"} 1"#));
    }
}
