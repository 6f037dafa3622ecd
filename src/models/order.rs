//! # Order Model
//!
//! The order aggregate as persisted in the `orders` table. Line items are stored as
//! JSONB; the total is computed once at creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Longest identifier accepted from the wire
pub const MAX_ORDER_ID_LEN: usize = 64;

/// One product line in an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub price: f64,
    pub quantity: u32,
}

impl OrderItem {
    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

/// An order and its current lifecycle status label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub items: Vec<OrderItem>,
    pub total: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a new order with a fresh id and order number
    pub fn new(items: Vec<OrderItem>, status: impl Into<String>) -> Self {
        let now = Utc::now();
        let total = calculate_total(&items);
        Self {
            id: new_order_id(),
            order_number: new_order_number(),
            items,
            total,
            status: status.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn calculate_total(items: &[OrderItem]) -> f64 {
    items.iter().map(OrderItem::subtotal).sum()
}

/// 24 lowercase hex characters, the same shape as the ids the order API issues
pub fn new_order_id() -> String {
    Uuid::new_v4().simple().to_string()[..24].to_string()
}

/// Human-facing order number, `ORD-` followed by 8 uppercase hex characters
pub fn new_order_number() -> String {
    format!(
        "ORD-{}",
        Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

/// Check that an identifier from a message or request is usable as a key
pub fn validate_order_id(order_id: &str) -> Result<(), PipelineError> {
    let reason = if order_id.is_empty() {
        Some("must not be empty")
    } else if order_id.len() > MAX_ORDER_ID_LEN {
        Some("exceeds 64 characters")
    } else if !order_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Some("contains characters other than letters, digits, '-' and '_'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PipelineError::InvalidOrderId {
            order_id: order_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
