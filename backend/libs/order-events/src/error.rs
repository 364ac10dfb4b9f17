//! Error types for the order event model

use crate::Money;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Business-rule violations of a well-formed order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("order_id is empty")]
    EmptyOrderId,

    #[error("customer_id (partition key) is empty")]
    EmptyCustomerId,

    #[error("{field} is {actual} characters long (max {max})")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("order has no line items")]
    NoItems,

    #[error("item {item_id}: quantity {quantity} is below 1")]
    InvalidQuantity { item_id: String, quantity: i64 },

    #[error("item {item_id}: price {price} is not positive")]
    NonPositivePrice { item_id: String, price: Money },

    #[error("item {item_id}: subtotal {actual} does not match quantity x price {expected}")]
    SubtotalMismatch {
        item_id: String,
        expected: Money,
        actual: Money,
    },

    #[error("total_amount {0} is not positive")]
    NonPositiveTotal(Money),

    #[error("total_amount {actual} does not match sum of items {expected}")]
    TotalMismatch { expected: Money, actual: Money },

    #[error("amount arithmetic overflowed")]
    AmountOverflow,

    #[error("created_at {created_at} is later than processing time {processed_at}")]
    CreatedAfterProcessing {
        created_at: DateTime<Utc>,
        processed_at: DateTime<Utc>,
    },
}

/// Failure to turn broker bytes into an [`crate::Order`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not a valid order document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure to serialize an [`crate::Order`].
#[derive(Error, Debug)]
#[error("failed to serialize order: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);
