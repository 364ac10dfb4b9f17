//! In-memory order sink with fault injection.

use super::{OrderSink, SourcePosition, UpsertOutcome};
use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use order_events::{Order, OrderId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOrder {
    pub order: Order,
    pub processed_at: DateTime<Utc>,
    pub source: SourcePosition,
}

#[derive(Debug, Default)]
struct SinkState {
    rows: HashMap<OrderId, StoredOrder>,
    insert_order: Vec<OrderId>,
    transient_failures: u32,
    rejected_ids: HashSet<OrderId>,
    attempts: usize,
}

/// Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderSink {
    state: Arc<Mutex<SinkState>>,
    strict_duplicates: bool,
    closed: Arc<AtomicBool>,
}

impl InMemoryOrderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare payloads on duplicate ids.
    pub fn strict(mut self) -> Self {
        self.strict_duplicates = true;
        self
    }

    /// Fail the next `n` upserts with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Reject every write of this id as a constraint violation.
    pub fn reject(&self, order_id: &OrderId) {
        self.state.lock().rejected_ids.insert(order_id.clone());
    }

    pub fn get(&self, order_id: &OrderId) -> Option<StoredOrder> {
        self.state.lock().rows.get(order_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored orders in insertion order.
    pub fn rows(&self) -> Vec<StoredOrder> {
        let state = self.state.lock();
        state
            .insert_order
            .iter()
            .filter_map(|id| state.rows.get(id).cloned())
            .collect()
    }

    /// Number of upsert calls, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderSink for InMemoryOrderSink {
    async fn upsert(
        &self,
        order: &Order,
        processed_at: DateTime<Utc>,
        source: SourcePosition,
    ) -> Result<UpsertOutcome, SinkError> {
        let mut state = self.state.lock();
        state.attempts += 1;

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(SinkError::Transient("injected connection reset".to_string()));
        }
        if state.rejected_ids.contains(&order.order_id) {
            return Err(SinkError::Structural(format!(
                "check constraint violated for {}",
                order.order_id
            )));
        }

        if let Some(existing) = state.rows.get(&order.order_id) {
            if self.strict_duplicates && !existing.order.same_content(order) {
                return Ok(UpsertOutcome::ConflictingDuplicate);
            }
            return Ok(UpsertOutcome::Duplicate);
        }

        state.rows.insert(
            order.order_id.clone(),
            StoredOrder {
                order: order.clone(),
                processed_at,
                source,
            },
        );
        state.insert_order.push(order.order_id.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
