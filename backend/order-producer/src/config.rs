//! Producer configuration, loaded from environment variables.
//!
//! `.env` is read first when present; unset variables fall back to defaults.

use order_pipeline::broker::kafka::KafkaProducerConfig;
use order_pipeline::telemetry::LogFormat;
use resilience::RetryConfig;
use serde::Deserialize;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

const COMPRESSION_CODECS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub kafka_bootstrap_servers: String,

    #[serde(default = "default_topic")]
    pub kafka_topic_orders: String,

    #[serde(default = "default_client_id")]
    pub producer_client_id: String,

    /// Orders generated per second
    #[serde(default = "default_rate")]
    pub producer_rate: u32,

    /// Seconds to run; 0 runs until signalled
    #[serde(default = "default_duration")]
    pub producer_duration: u64,

    #[serde(default = "default_seed")]
    pub mock_seed: u64,

    #[serde(default = "default_compression")]
    pub producer_compression: String,

    #[serde(default = "default_linger_ms")]
    pub producer_linger_ms: u64,

    #[serde(default = "default_batch_size")]
    pub producer_batch_size: usize,

    #[serde(default = "default_message_timeout_ms")]
    pub producer_message_timeout_ms: u64,

    /// Total publish attempts per order, first try included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "food-orders".to_string()
}

fn default_client_id() -> String {
    "order-producer".to_string()
}

fn default_rate() -> u32 {
    10
}

fn default_duration() -> u64 {
    60
}

fn default_seed() -> u64 {
    42
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_linger_ms() -> u64 {
    10
}

fn default_batch_size() -> usize {
    16384
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ProducerConfig {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Load and validate configuration from `(NAME, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_not_empty("KAFKA_BOOTSTRAP_SERVERS", &self.kafka_bootstrap_servers)?;
        check_not_empty("KAFKA_TOPIC_ORDERS", &self.kafka_topic_orders)?;
        check_range("PRODUCER_RATE", self.producer_rate, 1..=1000)?;
        check_range("PRODUCER_LINGER_MS", self.producer_linger_ms, 0..=1000)?;
        check_range("PRODUCER_BATCH_SIZE", self.producer_batch_size, 1024..=usize::MAX)?;
        check_range("PRODUCER_MESSAGE_TIMEOUT_MS", self.producer_message_timeout_ms, 1..=u64::MAX)?;
        check_range("MAX_RETRIES", self.max_retries, 1..=10)?;
        check_range("RETRY_BACKOFF_MS", self.retry_backoff_ms, 100..=10_000)?;

        if !COMPRESSION_CODECS.contains(&self.producer_compression.as_str()) {
            return Err(ConfigError::Invalid {
                name: "PRODUCER_COMPRESSION",
                reason: format!(
                    "'{}' is not one of {}",
                    self.producer_compression,
                    COMPRESSION_CODECS.join(", ")
                ),
            });
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid {
                name: "LOG_LEVEL",
                reason: format!("'{}' is not one of {}", self.log_level, LOG_LEVELS.join(", ")),
            });
        }
        Ok(())
    }

    /// `None` when the producer should run until signalled.
    pub fn run_duration(&self) -> Option<Duration> {
        (self.producer_duration > 0).then(|| Duration::from_secs(self.producer_duration))
    }

    /// Gap between two generated orders.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.producer_rate.max(1)))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn kafka_config(&self) -> KafkaProducerConfig {
        KafkaProducerConfig {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            client_id: self.producer_client_id.clone(),
            compression: self.producer_compression.clone(),
            linger_ms: self.producer_linger_ms,
            batch_size: self.producer_batch_size,
            message_timeout: Duration::from_millis(self.producer_message_timeout_ms),
            ..Default::default()
        }
    }
}

fn check_not_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn check_range<T>(name: &'static str, value: T, range: RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + Display,
{
    if !range.contains(&value) {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("{} is outside {}..={}", value, range.start(), range.end()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ProducerConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.kafka_bootstrap_servers, "localhost:9092");
        assert_eq!(config.kafka_topic_orders, "food-orders");
        assert_eq!(config.producer_rate, 10);
        assert_eq!(config.mock_seed, 42);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.run_duration(), Some(Duration::from_secs(60)));
        assert_eq!(config.publish_interval(), Duration::from_millis(100));
        assert_eq!(config.retry_config().max_attempts, 3);
    }

    #[test]
    fn test_overrides() {
        let config = ProducerConfig::from_vars(vars(&[
            ("PRODUCER_RATE", "250"),
            ("PRODUCER_DURATION", "0"),
            ("PRODUCER_COMPRESSION", "zstd"),
            ("LOG_FORMAT", "text"),
        ]))
        .unwrap();

        assert_eq!(config.producer_rate, 250);
        assert_eq!(config.run_duration(), None);
        assert_eq!(config.kafka_config().compression, "zstd");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for (name, value) in [
            ("PRODUCER_RATE", "0"),
            ("PRODUCER_RATE", "1001"),
            ("PRODUCER_LINGER_MS", "5000"),
            ("PRODUCER_BATCH_SIZE", "512"),
            ("MAX_RETRIES", "11"),
            ("RETRY_BACKOFF_MS", "50"),
        ] {
            let err = ProducerConfig::from_vars(vars(&[(name, value)])).unwrap_err();
            match err {
                ConfigError::Invalid { name: field, .. } => assert_eq!(field, name),
                other => panic!("{}={} gave {:?}", name, value, other),
            }
        }
    }

    #[test]
    fn test_unknown_codec_and_level_rejected() {
        assert!(ProducerConfig::from_vars(vars(&[("PRODUCER_COMPRESSION", "brotli")])).is_err());
        assert!(ProducerConfig::from_vars(vars(&[("LOG_LEVEL", "verbose")])).is_err());
    }

    #[test]
    fn test_unparsable_number_is_env_error() {
        let err = ProducerConfig::from_vars(vars(&[("PRODUCER_RATE", "fast")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
    }

    #[test]
    #[serial_test::serial]
    fn test_from_process_env() {
        std::env::set_var("MOCK_SEED", "7");
        std::env::set_var("KAFKA_TOPIC_ORDERS", "orders-test");
        let config = ProducerConfig::from_env();
        std::env::remove_var("MOCK_SEED");
        std::env::remove_var("KAFKA_TOPIC_ORDERS");

        let config = config.unwrap();
        assert_eq!(config.mock_seed, 7);
        assert_eq!(config.kafka_topic_orders, "orders-test");
    }
}
