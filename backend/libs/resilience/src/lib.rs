//! Resilience patterns for the order pipeline
//!
//! Bounded retry with exponential backoff for transient broker and store
//! failures. Callers classify their errors through [`Transient`]; permanent
//! errors are returned on the first attempt, transient ones are retried until
//! `max_attempts` is reached.
//!
//! # Example: Store write with retry
//!
//! ```rust,no_run
//! use resilience::{with_retry, RetryConfig, RetryError, Transient};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct StoreError;
//!
//! impl std::fmt::Display for StoreError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("connection reset")
//!     }
//! }
//!
//! impl Transient for StoreError {
//!     fn is_transient(&self) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RetryConfig::new(3, Duration::from_millis(100));
//!
//!     let result = with_retry(&config, || async {
//!         // Your store write here
//!         Err::<(), _>(StoreError)
//!     })
//!     .await;
//!
//!     assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
//! }
//! ```

pub mod metrics;
pub mod retry;

// Re-export main types for convenience
pub use retry::{with_retry, RetryConfig, RetryError, Transient};
