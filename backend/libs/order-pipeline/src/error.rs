//! Error taxonomy for the delivery pipeline.
//!
//! Permanent failures (`MalformedEvent`, `InvalidEvent`, structural store
//! rejections) are diverted to the failure router. Transient failures
//! (`BrokerError::Transient` on the publish path, `SinkError::Transient` on the
//! persist path) retry with bounded backoff; exhausting the retries escalates
//! to `PublishError::PublishFailed` or `PipelineError::RetryExhausted`.

use order_events::{DecodeError, EncodeError, Order, ValidationError};
use resilience::Transient;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors reported by a broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker temporarily unavailable (timeouts, leader election, full queue).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The request can never succeed as issued (record too large, unknown topic).
    #[error("broker rejected request: {0}")]
    Permanent(String),

    /// The client cannot continue (authentication, authorization, fatal librdkafka state).
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Errors reported by an order sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Connection loss, timeout, pool exhaustion, serialization failure, deadlock.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Constraint or data error; retrying cannot help.
    #[error("store rejected order: {0}")]
    Structural(String),
}

impl Transient for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Outcome of a failed [`crate::OrderPublisher::publish`] call.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The order violates its invariants; nothing was sent.
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] ValidationError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The broker did not acknowledge the record. Carries the order back to the caller.
    #[error("publish of {} failed after {attempts} attempt(s): {source}", .order.order_id)]
    PublishFailed {
        order: Box<Order>,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

impl PublishError {
    /// The order that could not be delivered, if the failure happened after validation.
    pub fn into_order(self) -> Option<Order> {
        match self {
            PublishError::PublishFailed { order, .. } => Some(*order),
            _ => None,
        }
    }
}

/// Errors surfaced by the consumer loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Payload could not be decoded. Permanent.
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] DecodeError),

    /// Payload decoded but violates business invariants. Permanent.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ValidationError),

    #[error("transient persist failure: {0}")]
    TransientPersistFailure(SinkError),

    /// Store rejected the order permanently.
    #[error("structural persist failure: {0}")]
    StructuralPersistFailure(SinkError),

    /// A transient failure outlasted the retry budget.
    #[error("{stage} retries exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        stage: &'static str,
        attempts: u32,
        last_error: String,
    },

    /// Broker failure outside the record path (poll, commit, pause).
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Permanent errors are routed to the dead-letter channel instead of retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedEvent(_)
                | PipelineError::InvalidEvent(_)
                | PipelineError::StructuralPersistFailure(_)
        )
    }
}

impl From<SinkError> for PipelineError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Transient(_) => PipelineError::TransientPersistFailure(err),
            SinkError::Structural(_) => PipelineError::StructuralPersistFailure(err),
        }
    }
}
