//! Seeded synthetic order generator.
//!
//! The same seed yields the same customers and the same sequence of orders;
//! only `created_at` follows the wall clock.

use chrono::{DateTime, Utc};
use order_events::{LineItem, Money, Order, OrderId, ValidationError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

pub const CUSTOMER_COUNT: usize = 100;
pub const MAX_ITEMS_PER_ORDER: usize = 5;
pub const MAX_QUANTITY: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub customer_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuItem {
    pub item_id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    pub price_cents: i64,
}

pub const MENU: [MenuItem; 20] = [
    MenuItem { item_id: "ITEM-001", name: "Classic Burger", category: "mains", price_cents: 899 },
    MenuItem { item_id: "ITEM-002", name: "Cheeseburger", category: "mains", price_cents: 999 },
    MenuItem { item_id: "ITEM-003", name: "Veggie Burger", category: "mains", price_cents: 949 },
    MenuItem { item_id: "ITEM-004", name: "Chicken Sandwich", category: "mains", price_cents: 899 },
    MenuItem { item_id: "ITEM-005", name: "Margherita Pizza", category: "mains", price_cents: 1299 },
    MenuItem { item_id: "ITEM-006", name: "Pepperoni Pizza", category: "mains", price_cents: 1449 },
    MenuItem { item_id: "ITEM-007", name: "Caesar Salad", category: "mains", price_cents: 849 },
    MenuItem { item_id: "ITEM-008", name: "Fish Tacos", category: "mains", price_cents: 1099 },
    MenuItem { item_id: "ITEM-009", name: "French Fries", category: "sides", price_cents: 349 },
    MenuItem { item_id: "ITEM-010", name: "Onion Rings", category: "sides", price_cents: 399 },
    MenuItem { item_id: "ITEM-011", name: "Mozzarella Sticks", category: "sides", price_cents: 549 },
    MenuItem { item_id: "ITEM-012", name: "Side Salad", category: "sides", price_cents: 449 },
    MenuItem { item_id: "ITEM-013", name: "Cola", category: "drinks", price_cents: 199 },
    MenuItem { item_id: "ITEM-014", name: "Iced Tea", category: "drinks", price_cents: 299 },
    MenuItem { item_id: "ITEM-015", name: "Lemonade", category: "drinks", price_cents: 299 },
    MenuItem { item_id: "ITEM-016", name: "Milkshake", category: "drinks", price_cents: 499 },
    MenuItem { item_id: "ITEM-017", name: "Chocolate Brownie", category: "desserts", price_cents: 399 },
    MenuItem { item_id: "ITEM-018", name: "Apple Pie", category: "desserts", price_cents: 449 },
    MenuItem { item_id: "ITEM-019", name: "Cheesecake", category: "desserts", price_cents: 549 },
    MenuItem { item_id: "ITEM-020", name: "Ice Cream Sundae", category: "desserts", price_cents: 499 },
];

const FIRST_NAMES: [&str; 20] = [
    "Ada", "Alan", "Barbara", "Claude", "Dennis", "Edsger", "Frances", "Grace", "Hedy", "Ivan",
    "John", "Katherine", "Linus", "Margaret", "Niklaus", "Radia", "Ken", "Shafi", "Tim", "Yukihiro",
];

const LAST_NAMES: [&str; 20] = [
    "Lovelace", "Turing", "Liskov", "Shannon", "Ritchie", "Dijkstra", "Allen", "Hopper", "Lamarr",
    "Sutherland", "McCarthy", "Johnson", "Torvalds", "Hamilton", "Wirth", "Perlman", "Thompson",
    "Goldwasser", "Berners-Lee", "Matsumoto",
];

pub struct OrderGenerator {
    rng: StdRng,
    customers: Vec<Customer>,
    sequence: u32,
}

impl OrderGenerator {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let customers = (1..=CUSTOMER_COUNT)
            .map(|n| generate_customer(&mut rng, n))
            .collect();

        Self {
            rng,
            customers,
            sequence: 0,
        }
    }

    pub fn customers(&self) -> &[Customer] {
        &self.customers
    }

    /// Orders generated so far.
    pub fn generated(&self) -> u32 {
        self.sequence
    }

    pub fn next_order(&mut self) -> Result<Order, ValidationError> {
        self.next_order_at(Utc::now())
    }

    /// Generate the next order as if created at `created_at`.
    pub fn next_order_at(&mut self, created_at: DateTime<Utc>) -> Result<Order, ValidationError> {
        self.sequence += 1;

        let customer = &self.customers[self.rng.gen_range(0..self.customers.len())];
        let item_count = self.rng.gen_range(1..=MAX_ITEMS_PER_ORDER);
        let picked: Vec<&MenuItem> = MENU.choose_multiple(&mut self.rng, item_count).collect();

        let mut items = Vec::with_capacity(picked.len());
        for menu_item in picked {
            let quantity = self.rng.gen_range(1..=MAX_QUANTITY);
            items.push(LineItem::new(
                menu_item.item_id,
                menu_item.name,
                quantity,
                Money::from_cents(menu_item.price_cents),
            )?);
        }

        Order::new(
            OrderId::generate(created_at.date_naive(), self.sequence),
            customer.customer_id.clone(),
            customer.name.clone(),
            customer.email.clone(),
            items,
            created_at,
        )
    }
}

fn generate_customer(rng: &mut StdRng, number: usize) -> Customer {
    let first = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
    let last = LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())];

    Customer {
        customer_id: format!("CUST-{:05}", number),
        name: format!("{} {}", first, last),
        email: format!(
            "{}.{}.{}@example.com",
            first.to_ascii_lowercase(),
            last.to_ascii_lowercase(),
            number
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = OrderGenerator::new(42);
        let mut b = OrderGenerator::new(42);
        assert_eq!(a.customers(), b.customers());

        for _ in 0..50 {
            assert_eq!(a.next_order_at(at()).unwrap(), b.next_order_at(at()).unwrap());
        }
    }

    #[test]
    fn test_different_seed_different_orders() {
        let mut a = OrderGenerator::new(1);
        let mut b = OrderGenerator::new(2);
        let left: Vec<_> = (0..20).map(|_| a.next_order_at(at()).unwrap()).collect();
        let right: Vec<_> = (0..20).map(|_| b.next_order_at(at()).unwrap()).collect();
        assert_ne!(left, right);
    }

    #[test]
    fn test_customers() {
        let generator = OrderGenerator::new(42);
        let customers = generator.customers();
        assert_eq!(customers.len(), CUSTOMER_COUNT);
        assert_eq!(customers[0].customer_id, "CUST-00001");
        assert_eq!(customers[99].customer_id, "CUST-00100");
        assert!(customers[6].email.ends_with(".7@example.com"));
        assert!(customers
            .iter()
            .all(|c| c.email == c.email.to_ascii_lowercase()));
    }

    #[test]
    fn test_orders_are_valid_and_bounded() {
        let mut generator = OrderGenerator::new(7);
        for expected_sequence in 1..=200u32 {
            let order = generator.next_order_at(at()).unwrap();
            order.validate().unwrap();

            assert_eq!(
                order.order_id.as_str(),
                format!("ORD-20250110-{:05}", expected_sequence)
            );
            assert!((1..=MAX_ITEMS_PER_ORDER).contains(&order.items.len()));

            let distinct: HashSet<_> = order.items.iter().map(|i| i.item_id.as_str()).collect();
            assert_eq!(distinct.len(), order.items.len());
            assert!(order
                .items
                .iter()
                .all(|i| (1..=MAX_QUANTITY).contains(&i.quantity)));
        }
        assert_eq!(generator.generated(), 200);
    }
}
