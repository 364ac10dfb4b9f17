//! Order Consumer - Main entry point
//!
//! Wires the Kafka consumer, PostgreSQL sink and dead-letter router into the
//! order consumer loop and runs it until a shutdown signal arrives.

use anyhow::{Context, Result};
use order_consumer::ConsumerConfig;
use order_pipeline::broker::kafka::{KafkaRecordConsumer, KafkaRecordProducer};
use order_pipeline::sink::postgres::{create_pool, health_check, migrate, PgOrderSink};
use order_pipeline::telemetry::init_tracing;
use order_pipeline::{
    log_metrics_snapshot, DeadLetterRouter, OrderConsumer, PipelineMetrics, RecordProducer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

const SERVICE_NAME: &str = "order-consumer";
const DEAD_LETTER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConsumerConfig::from_env().context("Failed to load consumer configuration")?;
    init_tracing(SERVICE_NAME, &config.log_level, config.log_format);

    run(config)
        .instrument(info_span!("service", service = SERVICE_NAME))
        .await
}

async fn run(config: ConsumerConfig) -> Result<()> {
    info!(config = ?config, "Starting order consumer");

    // The store must be reachable before this instance joins the group
    let pool = create_pool(&config.sink_config())
        .await
        .context("Failed to create database pool")?;
    health_check(&pool)
        .await
        .context("Database health check failed")?;
    migrate(&pool)
        .await
        .context("Failed to run database migrations")?;
    let sink = Arc::new(PgOrderSink::new(pool, config.strict_duplicate_check));

    let consumer = Arc::new(
        KafkaRecordConsumer::new(&config.kafka_consumer_config())
            .context("Failed to create Kafka consumer")?,
    );

    let dead_letter_producer = Arc::new(
        KafkaRecordProducer::new(&config.dead_letter_producer_config())
            .context("Failed to create dead-letter producer")?,
    );
    let router = Arc::new(DeadLetterRouter::new(
        dead_letter_producer.clone(),
        config.dead_letter_topic(),
        config.retry_config(),
    ));

    let metrics = Arc::new(PipelineMetrics::new(SERVICE_NAME));
    let mut order_consumer = OrderConsumer::new(consumer, sink, router, config.consumer_settings())
        .context("Invalid consumer settings")?
        .with_observer(metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = order_consumer.run(shutdown_rx).await;

    match dead_letter_producer.flush(DEAD_LETTER_FLUSH_TIMEOUT).await {
        Ok(0) => {}
        Ok(remaining) => warn!(remaining, "Dead-letter records still in flight at shutdown"),
        Err(e) => warn!(error = %e, "Dead-letter producer flush failed"),
    }
    log_metrics_snapshot();

    let stats = result.context("Order consumer stopped on a fatal broker error")?;
    if stats.halted_partitions > 0 {
        warn!(
            halted_partitions = stats.halted_partitions,
            "Partitions were halted during this run and need operator attention"
        );
    }

    info!(
        committed = stats.committed(),
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        routed = stats.routed,
        "Order consumer shutdown complete"
    );
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
