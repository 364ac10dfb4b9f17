//! Order Producer - Main entry point
//!
//! Publishes synthetic food orders until the configured duration ends or a
//! shutdown signal arrives, then flushes and reports what was delivered.

use anyhow::{Context, Result};
use order_pipeline::broker::kafka::KafkaRecordProducer;
use order_pipeline::telemetry::init_tracing;
use order_pipeline::{log_metrics_snapshot, OrderPublisher, PipelineMetrics};
use order_producer::{OrderGenerator, ProducerConfig, PublishLoop};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

const SERVICE_NAME: &str = "order-producer";

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProducerConfig::from_env().context("Failed to load producer configuration")?;
    init_tracing(SERVICE_NAME, &config.log_level, config.log_format);

    run(config)
        .instrument(info_span!("service", service = SERVICE_NAME))
        .await
}

async fn run(config: ProducerConfig) -> Result<()> {
    info!(
        bootstrap_servers = %config.kafka_bootstrap_servers,
        topic = %config.kafka_topic_orders,
        rate = config.producer_rate,
        duration_secs = config.producer_duration,
        seed = config.mock_seed,
        "Starting order producer"
    );

    let producer = Arc::new(
        KafkaRecordProducer::new(&config.kafka_config())
            .context("Failed to create Kafka producer")?,
    );
    let publisher = Arc::new(
        OrderPublisher::new(
            producer,
            config.kafka_topic_orders.clone(),
            config.retry_config(),
        )
        .with_observer(Arc::new(PipelineMetrics::new(SERVICE_NAME))),
    );

    match publisher.partition_count().await {
        Ok(partitions) => info!(topic = %publisher.topic(), partitions, "Topic metadata loaded"),
        Err(e) => warn!(topic = %publisher.topic(), error = %e, "Could not read topic metadata"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let summary = PublishLoop::new(
        publisher,
        OrderGenerator::new(config.mock_seed),
        config.publish_interval(),
        config.run_duration(),
    )
    .run(shutdown_rx)
    .await;
    log_metrics_snapshot();

    if !summary.is_clean() {
        anyhow::bail!(
            "{} of {} orders were not delivered ({} unflushed)",
            summary.failed,
            summary.generated,
            summary.unflushed
        );
    }

    info!("Order producer shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
