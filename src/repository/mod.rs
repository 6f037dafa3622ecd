//! # Repositories
//!
//! Storage capabilities the pipeline depends on. The publisher and the status
//! transition use case only see these traits; [`postgres`] backs them with sqlx and
//! [`in_memory`] provides test doubles with failure injection.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::{Order, PublicationRecord};

pub use in_memory::{InMemoryOrderRepository, InMemoryPublicationRecordRepository};
pub use postgres::{PostgresOrderRepository, PostgresPublicationRecordRepository};

/// Order store
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: &Order) -> StorageResult<()>;

    async fn find_by_id(&self, order_id: &str) -> StorageResult<Option<Order>>;

    /// Set the status of one order; `Ok(false)` when no order matched the id
    async fn update_status(&self, order_id: &str, status: &str) -> StorageResult<bool>;
}

/// Publication ledger
#[async_trait]
pub trait PublicationRecordRepository: Send + Sync {
    async fn create(&self, record: &PublicationRecord) -> StorageResult<()>;

    /// Most recent record for the order, if any
    async fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<PublicationRecord>>;

    /// Most recent record for the order whose `order_status` is one of `statuses`
    async fn find_latest_with_status(
        &self,
        order_id: &str,
        statuses: &[String],
    ) -> StorageResult<Option<PublicationRecord>>;

    /// Set the published flag of one record and restamp `published_at`;
    /// `Ok(false)` when the record does not exist
    async fn update_published_status(&self, record_id: Uuid, published: bool)
        -> StorageResult<bool>;

    /// Every record for the order, oldest first
    async fn list_by_order_id(&self, order_id: &str) -> StorageResult<Vec<PublicationRecord>>;

    /// Records still marked unpublished, oldest first, for reconciliation
    async fn list_unpublished(&self, limit: i64) -> StorageResult<Vec<PublicationRecord>>;
}
