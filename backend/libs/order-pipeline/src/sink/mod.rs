//! Persistence sink.
//!
//! The order id is the only uniqueness constraint: writing an id that already
//! exists is a successful no-op reported as a duplicate.

pub mod memory;
pub mod postgres;

use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use order_events::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Id already stored with the same payload (or payload not compared).
    Duplicate,
    /// Id already stored with a different payload. Only reported when the
    /// sink runs with the strict duplicate check.
    ConflictingDuplicate,
}

impl UpsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, UpsertOutcome::Inserted)
    }
}

/// Broker position the order was read from, stored for traceability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait OrderSink: Send + Sync {
    /// Insert the order unless its id already exists.
    async fn upsert(
        &self,
        order: &Order,
        processed_at: DateTime<Utc>,
        source: SourcePosition,
    ) -> Result<UpsertOutcome, SinkError>;

    /// Release store connections.
    async fn close(&self);
}
