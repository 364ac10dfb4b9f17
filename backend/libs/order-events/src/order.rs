use crate::error::{DecodeError, EncodeError, ValidationError};
use crate::{Money, OrderId};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column widths of the `orders` table.
pub const MAX_ID_LEN: usize = 50;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "completed" => Some(OrderStatus::Completed),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One menu item within an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: String,
    pub name: String,
    pub quantity: i64,
    pub price: Money,
    /// Producer-computed `quantity * price`. Checked, never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<Money>,
}

impl LineItem {
    /// Build a line item with its subtotal filled in.
    pub fn new(
        item_id: impl Into<String>,
        name: impl Into<String>,
        quantity: i64,
        price: Money,
    ) -> Result<Self, ValidationError> {
        let subtotal = price
            .checked_mul(quantity)
            .ok_or(ValidationError::AmountOverflow)?;
        Ok(Self {
            item_id: item_id.into(),
            name: name.into(),
            quantity,
            price,
            subtotal: Some(subtotal),
        })
    }

    pub fn line_total(&self) -> Result<Money, ValidationError> {
        self.price
            .checked_mul(self.quantity)
            .ok_or(ValidationError::AmountOverflow)
    }

    fn validate(&self) -> Result<Money, ValidationError> {
        check_len("items.item_id", &self.item_id, MAX_ID_LEN)?;
        check_len("items.name", &self.name, MAX_NAME_LEN)?;
        if self.quantity < 1 {
            return Err(ValidationError::InvalidQuantity {
                item_id: self.item_id.clone(),
                quantity: self.quantity,
            });
        }
        if !self.price.is_positive() {
            return Err(ValidationError::NonPositivePrice {
                item_id: self.item_id.clone(),
                price: self.price,
            });
        }
        let expected = self.line_total()?;
        if let Some(actual) = self.subtotal {
            if actual != expected {
                return Err(ValidationError::SubtotalMismatch {
                    item_id: self.item_id.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(expected)
    }
}

/// A food order, the unit of work flowing through the pipeline.
///
/// The payload is immutable once created: consumers may attach a processing
/// timestamp alongside it but never rewrite these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Partition key.
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub items: Vec<LineItem>,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Assemble a pending order whose total is the sum of its line items.
    pub fn new(
        order_id: OrderId,
        customer_id: impl Into<String>,
        customer_name: impl Into<String>,
        customer_email: impl Into<String>,
        items: Vec<LineItem>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let total_amount = sum_items(&items)?;
        Ok(Self {
            order_id,
            customer_id: customer_id.into(),
            customer_name: customer_name.into(),
            customer_email: customer_email.into(),
            items,
            total_amount,
            status: OrderStatus::Pending,
            created_at,
        })
    }

    /// Key used to select the broker partition.
    pub fn partition_key(&self) -> &str {
        &self.customer_id
    }

    /// Check the business invariants shared by publisher and consumer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.order_id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyOrderId);
        }
        check_len("order_id", self.order_id.as_str(), MAX_ID_LEN)?;
        if self.customer_id.trim().is_empty() {
            return Err(ValidationError::EmptyCustomerId);
        }
        check_len("customer_id", &self.customer_id, MAX_ID_LEN)?;
        check_len("customer_name", &self.customer_name, MAX_NAME_LEN)?;
        check_len("customer_email", &self.customer_email, MAX_EMAIL_LEN)?;

        if self.items.is_empty() {
            return Err(ValidationError::NoItems);
        }
        let expected = self.items.iter().try_fold(Money::ZERO, |acc, item| {
            acc.checked_add(item.validate()?)
                .ok_or(ValidationError::AmountOverflow)
        })?;

        if !self.total_amount.is_positive() {
            return Err(ValidationError::NonPositiveTotal(self.total_amount));
        }
        if self.total_amount != expected {
            return Err(ValidationError::TotalMismatch {
                expected,
                actual: self.total_amount,
            });
        }
        Ok(())
    }

    /// Resolve the processing timestamp for this order.
    ///
    /// A `created_at` up to `skew` ahead of `now` is tolerated (clocks of the
    /// producing and consuming hosts differ) and yields `created_at` itself, so
    /// creation never follows processing. Anything further ahead is rejected.
    pub fn processing_time(
        &self,
        now: DateTime<Utc>,
        skew: Duration,
    ) -> Result<DateTime<Utc>, ValidationError> {
        if self.created_at <= now {
            return Ok(now);
        }
        if self.created_at - now <= skew {
            return Ok(self.created_at);
        }
        Err(ValidationError::CreatedAfterProcessing {
            created_at: self.created_at,
            processed_at: now,
        })
    }

    /// Compare payloads the way the store sees them (timestamps at microsecond precision).
    pub fn same_content(&self, other: &Order) -> bool {
        self.order_id == other.order_id
            && self.customer_id == other.customer_id
            && self.customer_name == other.customer_name
            && self.customer_email == other.customer_email
            && self.total_amount == other.total_amount
            && self.status == other.status
            && self.created_at.trunc_subsecs(6) == other.created_at.trunc_subsecs(6)
            && self.items.len() == other.items.len()
            && self.items.iter().zip(&other.items).all(|(a, b)| {
                a.item_id == b.item_id
                    && a.name == b.name
                    && a.quantity == b.quantity
                    && a.price == b.price
            })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker payload. Does not run business validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn sum_items(items: &[LineItem]) -> Result<Money, ValidationError> {
    items.iter().try_fold(Money::ZERO, |acc, item| {
        acc.checked_add(item.line_total()?)
            .ok_or(ValidationError::AmountOverflow)
    })
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::FieldTooLong { field, max, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_order() -> Order {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 10, 14, 30, 0).unwrap();
        Order::new(
            OrderId::from("ORD-20250110-00001"),
            "CUST-00042",
            "Jane Doe",
            "jane.doe.42@example.com",
            vec![
                LineItem::new("ITEM-001", "Classic Burger", 2, Money::from_cents(899)).unwrap(),
                LineItem::new("ITEM-011", "French Fries", 1, Money::from_cents(399)).unwrap(),
            ],
            created_at,
        )
        .unwrap()
    }

    #[test]
    fn test_new_computes_total() {
        let order = sample_order();
        assert_eq!(order.total_amount, Money::from_cents(2197));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.partition_key(), "CUST-00042");
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let mut order = sample_order();
        order.total_amount = Money::from_cents(2000);
        assert_eq!(
            order.validate(),
            Err(ValidationError::TotalMismatch {
                expected: Money::from_cents(2197),
                actual: Money::from_cents(2000),
            })
        );
    }

    #[test]
    fn test_item_rules() {
        let mut order = sample_order();
        order.items[0].quantity = 0;
        assert!(matches!(
            order.validate(),
            Err(ValidationError::InvalidQuantity { quantity: 0, .. })
        ));

        let mut order = sample_order();
        order.items[1].price = Money::ZERO;
        order.items[1].subtotal = None;
        assert!(matches!(
            order.validate(),
            Err(ValidationError::NonPositivePrice { .. })
        ));

        let mut order = sample_order();
        order.items[0].subtotal = Some(Money::from_cents(1));
        assert!(matches!(
            order.validate(),
            Err(ValidationError::SubtotalMismatch { .. })
        ));

        let mut order = sample_order();
        order.items.clear();
        order.total_amount = Money::from_cents(100);
        assert_eq!(order.validate(), Err(ValidationError::NoItems));
    }

    #[test]
    fn test_empty_keys_rejected() {
        let mut order = sample_order();
        order.customer_id = "  ".to_string();
        assert_eq!(order.validate(), Err(ValidationError::EmptyCustomerId));

        let mut order = sample_order();
        order.order_id = OrderId::from("");
        assert_eq!(order.validate(), Err(ValidationError::EmptyOrderId));

        let mut order = sample_order();
        order.order_id = OrderId::from("X".repeat(51));
        assert!(matches!(
            order.validate(),
            Err(ValidationError::FieldTooLong { field: "order_id", .. })
        ));
    }

    #[test]
    fn test_wire_format() {
        let order = sample_order();
        let value: serde_json::Value = serde_json::from_slice(&order.to_bytes().unwrap()).unwrap();
        assert_eq!(value["order_id"], "ORD-20250110-00001");
        assert_eq!(value["total_amount"], 21.97);
        assert_eq!(value["status"], "pending");
        assert_eq!(value["items"][0]["subtotal"], 17.98);
        assert_eq!(value["created_at"], "2025-01-10T14:30:00Z");
    }

    #[test]
    fn test_decode_original_document() {
        let payload = br#"{
            "order_id": "ORD-20250110-00007",
            "customer_id": "CUST-00003",
            "customer_name": "Sam Lee",
            "customer_email": "sam.lee.3@example.com",
            "items": [{"item_id": "ITEM-005", "name": "Margherita Pizza", "quantity": 3, "price": 12.99}],
            "total_amount": 38.97,
            "status": "pending",
            "created_at": "2025-01-10T14:30:00.123456Z"
        }"#;
        let order = Order::from_bytes(payload).unwrap();
        assert_eq!(order.items[0].subtotal, None);
        assert_eq!(order.total_amount, Money::from_cents(3897));
        assert!(order.validate().is_ok());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Order::from_bytes(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            Order::from_bytes(b"not json"),
            Err(DecodeError::Malformed(_))
        ));

        let mut value = serde_json::to_value(sample_order()).unwrap();
        value["status"] = "shipped".into();
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Order::from_bytes(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_processing_time() {
        let order = sample_order();
        let skew = Duration::seconds(5);

        let later = order.created_at + Duration::minutes(1);
        assert_eq!(order.processing_time(later, skew), Ok(later));

        let slightly_earlier = order.created_at - Duration::seconds(2);
        assert_eq!(
            order.processing_time(slightly_earlier, skew),
            Ok(order.created_at)
        );

        let much_earlier = order.created_at - Duration::hours(1);
        assert!(matches!(
            order.processing_time(much_earlier, skew),
            Err(ValidationError::CreatedAfterProcessing { .. })
        ));
    }

    #[test]
    fn test_same_content_ignores_sub_microsecond_precision() {
        let order = sample_order();
        let mut stored = order.clone();
        stored.items[0].subtotal = None;
        stored.created_at += Duration::nanoseconds(300);
        assert!(order.same_content(&stored));

        stored.customer_name = "Someone Else".to_string();
        assert!(!order.same_content(&stored));
    }
}
