//! Consumer configuration, loaded from environment variables.
//!
//! `DATABASE_URL` takes precedence; otherwise the URL is assembled from the
//! `POSTGRES_*` variables.

use order_pipeline::broker::kafka::{KafkaConsumerConfig, KafkaProducerConfig};
use order_pipeline::sink::postgres::{mask_password, PgSinkConfig};
use order_pipeline::telemetry::LogFormat;
use order_pipeline::ConsumerSettings;
use resilience::RetryConfig;
use serde::Deserialize;
use std::fmt::{self, Display};
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

const OFFSET_RESETS: [&str; 2] = ["earliest", "latest"];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub kafka_bootstrap_servers: String,

    #[serde(default = "default_topic")]
    pub kafka_topic_orders: String,

    /// Defaults to `<topic>.dlq`
    pub kafka_topic_dead_letter: Option<String>,

    #[serde(default = "default_group_id")]
    pub consumer_group_id: String,

    #[serde(default = "default_client_id")]
    pub consumer_client_id: String,

    #[serde(default = "default_offset_reset")]
    pub consumer_auto_offset_reset: String,

    #[serde(default = "default_batch_size")]
    pub consumer_batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub consumer_poll_timeout_ms: u64,

    pub database_url: Option<String>,

    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_db")]
    pub postgres_db: String,

    #[serde(default = "default_postgres_user")]
    pub postgres_user: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_pool_size")]
    pub db_pool_size: u32,

    /// Total store attempts per record, first try included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Compare payloads when an order id is already stored
    #[serde(default)]
    pub strict_duplicate_check: bool,

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

fn default_group_id() -> String {
    "order-processors".to_string()
}

fn default_client_id() -> String {
    "order-consumer".to_string()
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_db() -> String {
    "food_orders".to_string()
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_postgres_password() -> String {
    "postgres".to_string()
}

fn default_pool_size() -> u32 {
    5
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

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("kafka_bootstrap_servers", &self.kafka_bootstrap_servers)
            .field("kafka_topic_orders", &self.kafka_topic_orders)
            .field("kafka_topic_dead_letter", &self.dead_letter_topic())
            .field("consumer_group_id", &self.consumer_group_id)
            .field("consumer_batch_size", &self.consumer_batch_size)
            .field("database_url", &mask_password(&self.database_url()))
            .field("db_pool_size", &self.db_pool_size)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("strict_duplicate_check", &self.strict_duplicate_check)
            .finish_non_exhaustive()
    }
}

impl ConsumerConfig {
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
        check_not_empty("KAFKA_TOPIC_DEAD_LETTER", &self.dead_letter_topic())?;
        check_not_empty("CONSUMER_GROUP_ID", &self.consumer_group_id)?;
        if self.dead_letter_topic() == self.kafka_topic_orders {
            return Err(ConfigError::Invalid {
                name: "KAFKA_TOPIC_DEAD_LETTER",
                reason: "must differ from KAFKA_TOPIC_ORDERS".to_string(),
            });
        }
        if !OFFSET_RESETS.contains(&self.consumer_auto_offset_reset.as_str()) {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_AUTO_OFFSET_RESET",
                reason: format!(
                    "'{}' is not one of {}",
                    self.consumer_auto_offset_reset,
                    OFFSET_RESETS.join(", ")
                ),
            });
        }

        check_range("CONSUMER_BATCH_SIZE", self.consumer_batch_size, 1..=10_000)?;
        check_range("CONSUMER_POLL_TIMEOUT_MS", self.consumer_poll_timeout_ms, 1..=60_000)?;
        check_range("POSTGRES_PORT", self.postgres_port, 1..=u16::MAX)?;
        check_range("DB_POOL_SIZE", self.db_pool_size, 1..=20)?;
        check_range("MAX_RETRIES", self.max_retries, 1..=10)?;
        check_range("RETRY_BACKOFF_MS", self.retry_backoff_ms, 100..=10_000)?;

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid {
                name: "LOG_LEVEL",
                reason: format!("'{}' is not one of {}", self.log_level, LOG_LEVELS.join(", ")),
            });
        }
        Ok(())
    }

    pub fn dead_letter_topic(&self) -> String {
        match &self.kafka_topic_dead_letter {
            Some(topic) => topic.clone(),
            None => format!("{}.dlq", self.kafka_topic_orders),
        }
    }

    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.postgres_user,
                self.postgres_password,
                self.postgres_host,
                self.postgres_port,
                self.postgres_db
            ),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn sink_config(&self) -> PgSinkConfig {
        PgSinkConfig {
            database_url: self.database_url(),
            max_connections: self.db_pool_size,
            min_connections: 1,
            strict_duplicates: self.strict_duplicate_check,
            ..Default::default()
        }
    }

    pub fn kafka_consumer_config(&self) -> KafkaConsumerConfig {
        KafkaConsumerConfig {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            group_id: self.consumer_group_id.clone(),
            client_id: self.consumer_client_id.clone(),
            topic: self.kafka_topic_orders.clone(),
            auto_offset_reset: self.consumer_auto_offset_reset.clone(),
            session_timeout: Duration::from_secs(30),
        }
    }

    /// Producer used by the dead-letter router.
    pub fn dead_letter_producer_config(&self) -> KafkaProducerConfig {
        KafkaProducerConfig {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            client_id: format!("{}-dlq", self.consumer_client_id),
            linger_ms: 0,
            ..Default::default()
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.consumer_batch_size,
            poll_timeout: Duration::from_millis(self.consumer_poll_timeout_ms),
            persist_retry: self.retry_config(),
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
