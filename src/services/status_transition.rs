//! # Status Transition Use Case
//!
//! Applies a consumed status event to its order and reconciles the publication
//! ledger. Safe to run any number of times for the same event: the order ends up
//! with the same status and the ledger holds at most the one record the first run
//! created.
//!
//! ```rust
//! use std::sync::Arc;
//! use order_status::repository::{InMemoryOrderRepository, InMemoryPublicationRecordRepository};
//! use order_status::services::{LedgerAction, StatusTransitionService};
//! use order_status::test_utils::sample_order;
//! use order_status::StatusEvent;
//!
//! # tokio_test::block_on(async {
//! let order = sample_order("criado");
//! let orders = Arc::new(InMemoryOrderRepository::with_orders(vec![order.clone()]));
//! let records = Arc::new(InMemoryPublicationRecordRepository::new());
//! let service = StatusTransitionService::new(orders, records);
//!
//! let outcome = service.apply(&StatusEvent::new(&order.id, "criado", 1000.0)).await.unwrap();
//! assert_eq!(outcome.applied_status, "em_processamento");
//! assert_eq!(outcome.ledger, LedgerAction::Created);
//! # });
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::messaging::{StatusEvent, StatusMessageProcessor};
use crate::models::{normalize_status, validate_order_id, PublicationRecord};
use crate::repository::{OrderRepository, PublicationRecordRepository};

/// What happened to the publication ledger while applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Created,
    MarkedPublished,
    Unchanged,
}

/// Result of one applied event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub order_id: String,
    pub previous_status: String,
    pub applied_status: String,
    pub ledger: LedgerAction,
}

pub struct StatusTransitionService {
    orders: Arc<dyn OrderRepository>,
    records: Arc<dyn PublicationRecordRepository>,
}

impl std::fmt::Debug for StatusTransitionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTransitionService").finish_non_exhaustive()
    }
}

impl StatusTransitionService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        records: Arc<dyn PublicationRecordRepository>,
    ) -> Self {
        Self { orders, records }
    }

    /// Look up, normalize, update, reconcile
    pub async fn apply(&self, event: &StatusEvent) -> Result<TransitionOutcome> {
        validate_order_id(&event.order_id)?;

        let order = self
            .orders
            .find_by_id(&event.order_id)
            .await?
            .ok_or_else(|| PipelineError::order_not_found(&event.order_id))?;

        let applied_status = normalize_status(&event.status);
        if applied_status != event.status {
            debug!(
                order_id = %event.order_id,
                reported = %event.status,
                applied = %applied_status,
                "Normalized creation signal"
            );
        }

        // The order can disappear between the lookup and the update
        if !self
            .orders
            .update_status(&event.order_id, &applied_status)
            .await?
        {
            return Err(PipelineError::order_not_found(&event.order_id));
        }

        let ledger = self.reconcile_ledger(event, &applied_status).await?;

        info!(
            order_id = %event.order_id,
            old_status = %order.status,
            new_status = %applied_status,
            ledger = ?ledger,
            "Order status updated"
        );

        Ok(TransitionOutcome {
            order_id: event.order_id.clone(),
            previous_status: order.status,
            applied_status,
            ledger,
        })
    }

    async fn reconcile_ledger(
        &self,
        event: &StatusEvent,
        applied_status: &str,
    ) -> Result<LedgerAction> {
        // Only a record for this event's status may be flipped; a newer record for
        // another status can still be sitting in the unpublished backlog
        let statuses = vec![event.status.clone(), applied_status.to_string()];
        match self
            .records
            .find_latest_with_status(&event.order_id, &statuses)
            .await?
        {
            None => {
                let record = PublicationRecord::new(
                    event.order_id.as_str(),
                    applied_status,
                    true,
                    event.timestamp,
                );
                self.records.create(&record).await?;
                Ok(LedgerAction::Created)
            }
            Some(record) if !record.published => {
                if !self.records.update_published_status(record.id, true).await? {
                    warn!(
                        order_id = %event.order_id,
                        record_id = %record.id,
                        "Publication record vanished before it could be marked published"
                    );
                    return Ok(LedgerAction::Unchanged);
                }
                Ok(LedgerAction::MarkedPublished)
            }
            Some(_) => Ok(LedgerAction::Unchanged),
        }
    }
}

#[async_trait]
impl StatusMessageProcessor for StatusTransitionService {
    async fn process_status_message(&self, event: &StatusEvent) -> Result<()> {
        self.apply(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderItem};
    use crate::repository::{InMemoryOrderRepository, InMemoryPublicationRecordRepository};

    fn order(status: &str) -> Order {
        Order::new(
            vec![OrderItem {
                product_id: "p-1".to_string(),
                product_name: "Widget".to_string(),
                price: 5.0,
                quantity: 1,
            }],
            status,
        )
    }

    fn service(
        orders: Vec<Order>,
    ) -> (
        StatusTransitionService,
        Arc<InMemoryOrderRepository>,
        Arc<InMemoryPublicationRecordRepository>,
    ) {
        let order_repo = Arc::new(InMemoryOrderRepository::with_orders(orders));
        let record_repo = Arc::new(InMemoryPublicationRecordRepository::new());
        (
            StatusTransitionService::new(order_repo.clone(), record_repo.clone()),
            order_repo,
            record_repo,
        )
    }

    #[tokio::test]
    async fn test_creation_signal_advances_order() {
        let existing = order("criado");
        let (service, orders, records) = service(vec![existing.clone()]);

        let outcome = service
            .apply(&StatusEvent::new(&existing.id, "criado", 1000.0))
            .await
            .unwrap();

        assert_eq!(outcome.previous_status, "criado");
        assert_eq!(outcome.applied_status, "em_processamento");
        assert_eq!(outcome.ledger, LedgerAction::Created);
        assert_eq!(
            orders.find_by_id(&existing.id).await.unwrap().unwrap().status,
            "em_processamento"
        );

        let ledger = records.all().await;
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].published);
        assert_eq!(ledger[0].order_status, "em_processamento");
    }

    #[tokio::test]
    async fn test_unpublished_record_is_flipped() {
        let existing = order("criado");
        let (service, _, records) = service(vec![existing.clone()]);
        let failed = PublicationRecord::new(existing.id.as_str(), "enviado", false, 1.0);
        records.create(&failed).await.unwrap();

        let outcome = service
            .apply(&StatusEvent::new(&existing.id, "enviado", 2.0))
            .await
            .unwrap();

        assert_eq!(outcome.ledger, LedgerAction::MarkedPublished);
        let ledger = records.all().await;
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].published);
    }

    #[tokio::test]
    async fn test_newer_failed_publication_stays_in_backlog() {
        let existing = order("criado");
        let (service, _, records) = service(vec![existing.clone()]);
        let announced = PublicationRecord::new(existing.id.as_str(), "criado", true, 1.0);
        let failed = PublicationRecord::new(existing.id.as_str(), "enviado", false, 2.0);
        records.create(&announced).await.unwrap();
        records.create(&failed).await.unwrap();

        let outcome = service
            .apply(&StatusEvent::new(&existing.id, "criado", 1.0))
            .await
            .unwrap();

        assert_eq!(outcome.ledger, LedgerAction::Unchanged);
        let backlog = records.list_unpublished(10).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, failed.id);
    }

    #[tokio::test]
    async fn test_missing_order_is_not_found() {
        let (service, _, records) = service(vec![]);
        let err = service
            .apply(&StatusEvent::new("ffffffffffffffffffffffff", "criado", 1.0))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::OrderNotFound { .. }));
        assert!(err.is_permanent());
        assert!(records.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_order_id_is_permanent() {
        let (service, _, _) = service(vec![]);
        let err = service
            .apply(&StatusEvent::new("not an id!", "criado", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOrderId { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_storage_failure_is_transient() {
        let existing = order("criado");
        let (service, orders, _) = service(vec![existing.clone()]);
        orders.set_failing(true);

        let err = service
            .apply(&StatusEvent::new(&existing.id, "enviado", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(!err.is_permanent());
    }
}
