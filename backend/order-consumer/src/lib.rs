//! Food-order consumer.
//!
//! Reads orders from Kafka, stores them in PostgreSQL and commits offsets only
//! after the store (or the dead-letter topic) has accepted each record.

pub mod config;

pub use config::{ConfigError, ConsumerConfig};
