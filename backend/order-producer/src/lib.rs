//! Food-order producer.
//!
//! Generates reproducible synthetic orders and publishes them to Kafka at a
//! fixed rate through the idempotent [`order_pipeline::OrderPublisher`].

pub mod config;
pub mod generator;
pub mod runner;

pub use config::{ConfigError, ProducerConfig};
pub use generator::{Customer, MenuItem, OrderGenerator, MENU};
pub use runner::{PublishLoop, PublishSummary};
