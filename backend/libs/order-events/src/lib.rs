//! # Order Events
//!
//! The food order entity shared by the producer and consumer services, its
//! JSON wire representation, and the business invariants both sides enforce.
//!
//! ## Invariants
//!
//! - `order_id` is the sole deduplication key and is never empty.
//! - `customer_id` is the partition key and is never empty.
//! - `total_amount` is strictly positive and equals the sum of
//!   `quantity * price` over all line items. It is recomputed on validation,
//!   never trusted from the wire.
//! - `created_at` is set by the producer and never precedes processing.
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use order_events::{LineItem, Money, Order, OrderId};
//!
//! let order = Order::new(
//!     OrderId::generate(Utc::now().date_naive(), 1),
//!     "CUST-00001",
//!     "Jane Doe",
//!     "jane.doe.1@example.com",
//!     vec![LineItem::new("ITEM-001", "Classic Burger", 2, Money::from_cents(899)).unwrap()],
//!     Utc::now(),
//! )
//! .unwrap();
//!
//! assert!(order.validate().is_ok());
//! let bytes = order.to_bytes().unwrap();
//! assert_eq!(Order::from_bytes(&bytes).unwrap().total_amount, Money::from_cents(1798));
//! ```

pub mod error;
mod id;
mod money;
mod order;

pub use error::{DecodeError, EncodeError, ValidationError};
pub use id::OrderId;
pub use money::Money;
pub use order::{LineItem, Order, OrderStatus, MAX_EMAIL_LEN, MAX_ID_LEN, MAX_NAME_LEN};
