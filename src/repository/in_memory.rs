//! In-memory repositories for tests and broker-less local runs.
//!
//! Both stores can be switched into a failing mode where every call returns
//! [`StorageError::Database`], to exercise the transient-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{Order, PublicationRecord};
use crate::repository::{OrderRepository, PublicationRecordRepository};

#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, Order>>,
    failing: AtomicBool,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing orders
    pub fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        Self {
            orders: RwLock::new(
                orders
                    .into_iter()
                    .map(|order| (order.id.clone(), order))
                    .collect(),
            ),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    fn check(&self, operation: &str) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::database(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, order: &Order) -> StorageResult<()> {
        self.check("create order")?;
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StorageError::Conflict {
                message: format!("order {} already exists", order.id),
            });
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn find_by_id(&self, order_id: &str) -> StorageResult<Option<Order>> {
        self.check("find order")?;
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn update_status(&self, order_id: &str, status: &str) -> StorageResult<bool> {
        self.check("update order status")?;
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(order) => {
                order.status = status.to_string();
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Ledger kept in insertion order
#[derive(Debug, Default)]
pub struct InMemoryPublicationRecordRepository {
    records: RwLock<Vec<PublicationRecord>>,
    failing: AtomicBool,
}

impl InMemoryPublicationRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every record
    pub async fn all(&self) -> Vec<PublicationRecord> {
        self.records.read().await.clone()
    }

    fn check(&self, operation: &str) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::database(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PublicationRecordRepository for InMemoryPublicationRecordRepository {
    async fn create(&self, record: &PublicationRecord) -> StorageResult<()> {
        self.check("create publication record")?;
        let mut records = self.records.write().await;
        if records.iter().any(|existing| existing.id == record.id) {
            return Err(StorageError::Conflict {
                message: format!("publication record {} already exists", record.id),
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<PublicationRecord>> {
        self.check("find publication record")?;
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|record| record.order_id == order_id)
            .cloned())
    }

    async fn find_latest_with_status(
        &self,
        order_id: &str,
        statuses: &[String],
    ) -> StorageResult<Option<PublicationRecord>> {
        self.check("find publication record by status")?;
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|record| record.order_id == order_id && statuses.contains(&record.order_status))
            .cloned())
    }

    async fn update_published_status(
        &self,
        record_id: Uuid,
        published: bool,
    ) -> StorageResult<bool> {
        self.check("update publication record")?;
        let mut records = self.records.write().await;
        match records.iter_mut().find(|record| record.id == record_id) {
            Some(record) => {
                record.published = published;
                record.published_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_order_id(&self, order_id: &str) -> StorageResult<Vec<PublicationRecord>> {
        self.check("list publication records")?;
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn list_unpublished(&self, limit: i64) -> StorageResult<Vec<PublicationRecord>> {
        self.check("list unpublished records")?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|record| !record.published)
            .take(limit)
            .cloned()
            .collect())
    }
}
