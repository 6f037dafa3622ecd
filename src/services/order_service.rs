//! # Order Service
//!
//! Producer-side use cases: create an order, read it, change its status. Each
//! mutation is committed to the order store first and then announced through the
//! [`StatusPublisher`]. A failed publish is logged and left to the publication
//! ledger; the caller still gets the committed order.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::messaging::message::epoch_seconds;
use crate::messaging::StatusPublisher;
use crate::models::{validate_order_id, Order, OrderItem, OrderStatus, PublicationRecord};
use crate::repository::{OrderRepository, PublicationRecordRepository};

/// Status label new orders start with
pub const DEFAULT_INITIAL_STATUS: &str = "criado";

pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    records: Arc<dyn PublicationRecordRepository>,
    publisher: Arc<dyn StatusPublisher>,
    initial_status: String,
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("initial_status", &self.initial_status)
            .finish_non_exhaustive()
    }
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        records: Arc<dyn PublicationRecordRepository>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            orders,
            records,
            publisher,
            initial_status: DEFAULT_INITIAL_STATUS.to_string(),
        }
    }

    /// Use a different initial label, e.g. `created` for English deployments
    pub fn with_initial_status(mut self, status: impl Into<String>) -> Self {
        self.initial_status = status.into();
        self
    }

    pub async fn create_order(&self, items: Vec<OrderItem>) -> Result<Order> {
        validate_items(&items)?;

        let order = Order::new(items, self.initial_status.as_str());
        self.orders.create(&order).await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = order.total,
            "Order created"
        );

        self.announce(&order).await;
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Order> {
        validate_order_id(order_id)?;
        self.orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| PipelineError::order_not_found(order_id))
    }

    pub async fn update_order_status(&self, order_id: &str, status: &str) -> Result<Order> {
        validate_order_id(order_id)?;
        if OrderStatus::from_label(status).is_none() {
            return Err(PipelineError::InvalidStatus {
                status: status.to_string(),
            });
        }

        if !self.orders.update_status(order_id, status).await? {
            return Err(PipelineError::order_not_found(order_id));
        }

        let order = self.get_order(order_id).await?;
        info!(order_id = %order.id, status = %order.status, "Order status changed");

        self.announce(&order).await;
        Ok(order)
    }

    /// Every publication record for an order, oldest first
    pub async fn publication_history(&self, order_id: &str) -> Result<Vec<PublicationRecord>> {
        validate_order_id(order_id)?;
        Ok(self.records.list_by_order_id(order_id).await?)
    }

    /// Status changes that never reached the broker, oldest first
    pub async fn unpublished_backlog(&self, limit: i64) -> Result<Vec<PublicationRecord>> {
        Ok(self.records.list_unpublished(limit).await?)
    }

    async fn announce(&self, order: &Order) {
        let timestamp = epoch_seconds(chrono::Utc::now());
        if let Err(e) = self
            .publisher
            .publish(&order.id, &order.status, timestamp)
            .await
        {
            warn!(
                order_id = %order.id,
                status = %order.status,
                error = %e,
                "Status event not published; order change stands"
            );
        }
    }
}

fn validate_items(items: &[OrderItem]) -> Result<()> {
    if items.is_empty() {
        return Err(PipelineError::InvalidRequest(
            "an order needs at least one item".to_string(),
        ));
    }
    for item in items {
        if item.quantity == 0 {
            return Err(PipelineError::InvalidRequest(format!(
                "item {} has zero quantity",
                item.product_id
            )));
        }
        if !item.price.is_finite() || item.price < 0.0 {
            return Err(PipelineError::InvalidRequest(format!(
                "item {} has an invalid price",
                item.product_id
            )));
        }
    }
    Ok(())
}
