//! # Status Consumer Integration Tests
//!
//! Runs the consumer loop against the in-memory broker and checks how each kind of
//! delivery is settled and what it does to the order store and the ledger.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{eventually, Pipeline};
use order_status::error::{PipelineError, StorageError};
use order_status::messaging::{Settlement, StatusEvent, StatusMessageProcessor};
use order_status::repository::{InMemoryOrderRepository, InMemoryPublicationRecordRepository};
use order_status::services::StatusTransitionService;
use order_status::test_utils::sample_order;
use serde_json::json;

/// Fails with a storage error a fixed number of times, then delegates
struct FlakyProcessor {
    inner: StatusTransitionService,
    failures_left: AtomicUsize,
}

#[async_trait]
impl StatusMessageProcessor for FlakyProcessor {
    async fn process_status_message(&self, event: &StatusEvent) -> order_status::Result<()> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Storage(StorageError::database(
                "update_status",
                "connection reset by peer",
            )));
        }
        self.inner.process_status_message(event).await
    }
}

fn event_bytes(order_id: &str, status: &str, timestamp: f64) -> Vec<u8> {
    StatusEvent::new(order_id, status, timestamp)
        .to_bytes()
        .unwrap()
}

async fn wait_for_settlements(pipeline: &Pipeline, count: usize) {
    let broker = pipeline.broker.clone();
    eventually("deliveries settled", || {
        let broker = broker.clone();
        async move { broker.settlements().len() >= count }
    })
    .await;
}

#[tokio::test]
async fn test_creation_event_moves_order_to_processing() {
    let order = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![order.clone()]);
    pipeline.start().await;

    pipeline
        .publish_raw(&event_bytes(&order.id, "criado", 1000.0))
        .await;
    wait_for_settlements(&pipeline, 1).await;

    let stored = pipeline.stored_status(&order.id).await;
    assert_eq!(stored, "em_processamento");

    let ledger = pipeline.records.all().await;
    assert_eq!(ledger.len(), 1);
    assert!(ledger[0].published);
    assert_eq!(ledger[0].order_id, order.id);
    assert_eq!(ledger[0].order_status, "em_processamento");
    assert_eq!(ledger[0].timestamp, 1000.0);

    assert_eq!(pipeline.broker.settlements()[0].settlement, Settlement::Acked);
    assert_eq!(pipeline.broker.unacked_count("order-status"), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unknown_order_is_dead_lettered() {
    let mut pipeline = Pipeline::new(vec![]);
    pipeline.start().await;

    let body = event_bytes("ffffffffffffffffffffffff", "criado", 1000.0);
    pipeline.publish_raw(&body).await;
    wait_for_settlements(&pipeline, 1).await;

    assert_eq!(
        pipeline.broker.settlements()[0].settlement,
        Settlement::Rejected
    );
    assert_eq!(pipeline.broker.queued_messages("order-status.dlq"), vec![body]);
    assert_eq!(pipeline.broker.queue_depth("order-status"), 0);
    assert!(pipeline.records.all().await.is_empty());

    let stats = pipeline.consumer.stats().snapshot();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.requeued, 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_malformed_payloads_are_dead_lettered() {
    let mut pipeline = Pipeline::new(vec![]);
    pipeline.start().await;

    pipeline.publish_raw(b"not json at all").await;
    pipeline
        .publish_raw(json!({ "order_id": "abc" }).to_string().as_bytes())
        .await;
    wait_for_settlements(&pipeline, 2).await;

    assert!(pipeline
        .broker
        .settlements()
        .iter()
        .all(|s| s.settlement == Settlement::Rejected));
    assert_eq!(pipeline.broker.queue_depth("order-status.dlq"), 2);
    assert_eq!(pipeline.consumer.stats().snapshot().dead_lettered, 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_missing_timestamp_still_records_publication() {
    let order = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![order.clone()]);
    pipeline.start().await;

    let body = json!({ "order_id": order.id, "status": "enviado" }).to_string();
    pipeline.publish_raw(body.as_bytes()).await;
    wait_for_settlements(&pipeline, 1).await;

    assert_eq!(pipeline.stored_status(&order.id).await, "enviado");
    let ledger = pipeline.records.all().await;
    assert_eq!(ledger.len(), 1);
    assert!(ledger[0].timestamp > 0.0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_is_requeued_until_it_succeeds() {
    let order = sample_order("criado");
    let orders = Arc::new(InMemoryOrderRepository::with_orders(vec![order.clone()]));
    let records = Arc::new(InMemoryPublicationRecordRepository::new());
    let processor = Arc::new(FlakyProcessor {
        inner: StatusTransitionService::new(orders.clone(), records.clone()),
        failures_left: AtomicUsize::new(2),
    });
    let mut pipeline = Pipeline::with_processor(orders, records, processor);
    pipeline.start().await;

    pipeline
        .publish_raw(&event_bytes(&order.id, "enviado", 5.0))
        .await;
    wait_for_settlements(&pipeline, 3).await;

    let outcomes: Vec<Settlement> = pipeline
        .broker
        .settlements()
        .into_iter()
        .map(|s| s.settlement)
        .collect();
    assert_eq!(
        outcomes,
        vec![Settlement::Requeued, Settlement::Requeued, Settlement::Acked]
    );
    assert_eq!(pipeline.stored_status(&order.id).await, "enviado");
    assert_eq!(pipeline.records.all().await.len(), 1);

    let stats = pipeline.consumer.stats().snapshot();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acked, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_event_is_idempotent() {
    let order = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![order.clone()]);
    pipeline.start().await;

    let body = event_bytes(&order.id, "criado", 1000.0);
    pipeline.publish_raw(&body).await;
    pipeline.publish_raw(&body).await;
    wait_for_settlements(&pipeline, 2).await;

    assert_eq!(pipeline.stored_status(&order.id).await, "em_processamento");
    assert_eq!(pipeline.records.all().await.len(), 1);
    assert_eq!(pipeline.consumer.stats().snapshot().acked, 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_one_delivery_in_flight_at_a_time() {
    let first = sample_order("criado");
    let second = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![first.clone(), second.clone()]);
    pipeline.start().await;
    assert_eq!(pipeline.broker.prefetch(), Some(1));

    pipeline
        .publish_raw(&event_bytes(&first.id, "enviado", 1.0))
        .await;
    pipeline
        .publish_raw(&event_bytes(&second.id, "enviado", 2.0))
        .await;
    wait_for_settlements(&pipeline, 2).await;

    let tags: Vec<u64> = pipeline
        .broker
        .settlements()
        .iter()
        .map(|s| s.delivery_tag)
        .collect();
    assert_eq!(tags, vec![1, 2]);
    assert_eq!(pipeline.stored_status(&first.id).await, "enviado");
    assert_eq!(pipeline.stored_status(&second.id).await, "enviado");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_consumer_re_registers_after_connection_loss() {
    let order = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![order.clone()]);
    pipeline.start().await;

    pipeline.broker.disconnect();
    pipeline.broker.reconnect();

    let broker = pipeline.broker.clone();
    let stats = pipeline.consumer.stats();
    eventually("consumer re-registered", || {
        let broker = broker.clone();
        let stats = stats.clone();
        async move { broker.has_consumer("order-status") && stats.snapshot().stream_restarts >= 1 }
    })
    .await;

    pipeline
        .publish_raw(&event_bytes(&order.id, "entregue", 3.0))
        .await;
    wait_for_settlements(&pipeline, 1).await;
    assert_eq!(pipeline.stored_status(&order.id).await, "entregue");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_messages_wait_in_queue_after_shutdown() {
    let order = sample_order("criado");
    let mut pipeline = Pipeline::new(vec![order.clone()]);
    pipeline.start().await;
    assert!(!pipeline.consumer.is_stopped());

    let broker = pipeline.broker.clone();
    let consumer = pipeline.consumer.clone();
    pipeline.shutdown().await;
    assert!(consumer.is_stopped());
    assert!(!broker.has_consumer("order-status"));

    let channel = order_status::messaging::ChannelProvider::channel(&broker)
        .await
        .unwrap();
    channel
        .publish(
            "orders",
            "order-status",
            &event_bytes(&order.id, "enviado", 1.0),
        )
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("order-status"), 1);
    assert!(broker.settlements().is_empty());
}
