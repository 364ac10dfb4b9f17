//! Order identifiers.
//!
//! Identifiers are date-coded sequences, `ORD-{YYYYMMDD}-{sequence:05}`, so an
//! operator can tell when an order was generated just by reading its id. The
//! deduplication logic only relies on identifiers being unique strings; the
//! structured form is decoded on demand.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX: &str = "ORD";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Build the identifier for the `sequence`-th order generated on `date`.
    pub fn generate(date: NaiveDate, sequence: u32) -> Self {
        Self(format!("{}-{}-{:05}", PREFIX, date.format("%Y%m%d"), sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Decode the generation date and sequence number.
    ///
    /// Returns `None` when the identifier was not produced by [`OrderId::generate`].
    pub fn decode(&self) -> Option<(NaiveDate, u32)> {
        let mut parts = self.0.splitn(3, '-');
        if parts.next()? != PREFIX {
            return None;
        }
        let date = parts.next()?;
        let sequence = parts.next()?;
        if date.len() != 8 || sequence.len() < 5 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
        let sequence = sequence.parse().ok()?;
        Some((date, sequence))
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert_eq!(OrderId::generate(date, 1).as_str(), "ORD-20250110-00001");
        assert_eq!(OrderId::generate(date, 123456).as_str(), "ORD-20250110-123456");
    }

    #[test]
    fn test_decode() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let id = OrderId::generate(date, 42);
        assert_eq!(id.decode(), Some((date, 42)));
    }

    #[test]
    fn test_decode_rejects_foreign_ids() {
        assert_eq!(OrderId::from("order-1").decode(), None);
        assert_eq!(OrderId::from("ORD-2025011-00001").decode(), None);
        assert_eq!(OrderId::from("ORD-20251340-00001").decode(), None);
        assert_eq!(OrderId::from("ORD-20250110-1").decode(), None);
        assert_eq!(OrderId::from("ORD-20250110-0000x").decode(), None);
    }
}
