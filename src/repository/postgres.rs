//! PostgreSQL-backed repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::models::{Order, OrderItem, PublicationRecord};
use crate::repository::{OrderRepository, PublicationRecordRepository};

/// Row shape of the `orders` table
#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    order_number: String,
    items: Json<Vec<OrderItem>>,
    total: f64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id,
            order_number: row.order_number,
            items: row.items.0,
            total: row.total,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn create(&self, order: &Order) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, order_number, items, total, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&order.id)
        .bind(&order.order_number)
        .bind(Json(&order.items))
        .bind(order.total)
        .bind(&order.status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(order_id = %order.id, order_number = %order.order_number, "Order inserted");
        Ok(())
    }

    async fn find_by_id(&self, order_id: &str) -> StorageResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT id, order_number, items, total, status, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::database("find order", e.to_string()))?;

        Ok(row.map(Order::from))
    }

    async fn update_status(&self, order_id: &str, status: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::database("update order status", e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPublicationRecordRepository {
    pool: PgPool,
}

impl PostgresPublicationRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PublicationRecordRepository for PostgresPublicationRecordRepository {
    async fn create(&self, record: &PublicationRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO publication_records (id, order_id, published, order_status, ts, published_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.order_id)
        .bind(record.published)
        .bind(&record.order_status)
        .bind(record.timestamp)
        .bind(record.published_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<PublicationRecord>> {
        let record = sqlx::query_as::<_, PublicationRecord>(
            r#"
            SELECT id, order_id, published, order_status, ts, published_at
            FROM publication_records
            WHERE order_id = $1
            ORDER BY published_at DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::database("find publication record", e.to_string()))?;

        Ok(record)
    }

    async fn find_latest_with_status(
        &self,
        order_id: &str,
        statuses: &[String],
    ) -> StorageResult<Option<PublicationRecord>> {
        let record = sqlx::query_as::<_, PublicationRecord>(
            r#"
            SELECT id, order_id, published, order_status, ts, published_at
            FROM publication_records
            WHERE order_id = $1 AND order_status = ANY($2)
            ORDER BY published_at DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .bind(statuses)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::database("find publication record by status", e.to_string()))?;

        Ok(record)
    }

    async fn update_published_status(
        &self,
        record_id: Uuid,
        published: bool,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publication_records
            SET published = $2, published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(published)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::database("update publication record", e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_order_id(&self, order_id: &str) -> StorageResult<Vec<PublicationRecord>> {
        let records = sqlx::query_as::<_, PublicationRecord>(
            r#"
            SELECT id, order_id, published, order_status, ts, published_at
            FROM publication_records
            WHERE order_id = $1
            ORDER BY published_at ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_unpublished(&self, limit: i64) -> StorageResult<Vec<PublicationRecord>> {
        let records = sqlx::query_as::<_, PublicationRecord>(
            r#"
            SELECT id, order_id, published, order_status, ts, published_at
            FROM publication_records
            WHERE published = false
            ORDER BY published_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> PgPool {
        let url = crate::test_utils::get_test_database_url();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL running"]
    async fn test_order_roundtrip_and_status_update() {
        let repo = PostgresOrderRepository::new(test_pool().await);
        let order = Order::new(
            vec![OrderItem {
                product_id: "p-1".to_string(),
                product_name: "Widget".to_string(),
                price: 9.5,
                quantity: 2,
            }],
            "criado",
        );

        repo.create(&order).await.unwrap();
        let found = repo.find_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(found.items, order.items);
        assert_eq!(found.total, 19.0);

        assert!(repo.update_status(&order.id, "em_processamento").await.unwrap());
        let found = repo.find_by_id(&order.id).await.unwrap().unwrap();
        assert_eq!(found.status, "em_processamento");

        assert!(!repo
            .update_status("ffffffffffffffffffffffff", "enviado")
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL running"]
    async fn test_publication_ledger_queries() {
        let repo = PostgresPublicationRecordRepository::new(test_pool().await);
        let order_id = crate::models::order::new_order_id();

        let failed = PublicationRecord::new(&order_id, "criado", false, 1000.0);
        repo.create(&failed).await.unwrap();

        let latest = repo.find_by_order_id(&order_id).await.unwrap().unwrap();
        assert_eq!(latest.id, failed.id);
        assert!(!latest.published);

        let shipped = PublicationRecord::new(&order_id, "enviado", true, 2000.0);
        repo.create(&shipped).await.unwrap();
        let statuses = vec!["criado".to_string(), "em_processamento".to_string()];
        let matched = repo
            .find_latest_with_status(&order_id, &statuses)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.id, failed.id);

        let backlog = repo.list_unpublished(1000).await.unwrap();
        assert!(backlog.iter().any(|r| r.id == failed.id));

        assert!(repo.update_published_status(failed.id, true).await.unwrap());
        let history = repo.list_by_order_id(&order_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.published));
    }
}
