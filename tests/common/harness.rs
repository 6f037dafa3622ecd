//! # Pipeline Test Harness
//!
//! Wires the publisher, consumer and status transition use case to an
//! [`InMemoryBroker`] and in-memory repositories, so integration tests can drive
//! the whole pipeline without RabbitMQ or PostgreSQL.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use order_status::messaging::{
    AmqpStatusPublisher, ChannelProvider, InMemoryBroker, StatusConsumer, StatusMessageProcessor,
};
use order_status::models::Order;
use order_status::repository::{
    InMemoryOrderRepository, InMemoryPublicationRecordRepository, OrderRepository,
};
use order_status::services::StatusTransitionService;
use order_status::test_utils::in_memory_consumer;
use tokio::task::JoinHandle;

const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);
const EVENTUALLY_POLL: Duration = Duration::from_millis(10);

pub struct Pipeline {
    pub broker: InMemoryBroker,
    pub orders: Arc<InMemoryOrderRepository>,
    pub records: Arc<InMemoryPublicationRecordRepository>,
    pub consumer: Arc<StatusConsumer>,
    runner: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Pipeline whose consumer applies events with [`StatusTransitionService`]
    pub fn new(orders: Vec<Order>) -> Self {
        let orders = Arc::new(InMemoryOrderRepository::with_orders(orders));
        let records = Arc::new(InMemoryPublicationRecordRepository::new());
        let processor = Arc::new(StatusTransitionService::new(orders.clone(), records.clone()));
        Self::with_processor(orders, records, processor)
    }

    pub fn with_processor(
        orders: Arc<InMemoryOrderRepository>,
        records: Arc<InMemoryPublicationRecordRepository>,
        processor: Arc<dyn StatusMessageProcessor>,
    ) -> Self {
        let broker = InMemoryBroker::new();
        let consumer = Arc::new(in_memory_consumer(&broker, processor));
        Self {
            broker,
            orders,
            records,
            consumer,
            runner: None,
        }
    }

    /// Spawn the consumer loop and wait for it to register
    pub async fn start(&mut self) {
        let consumer = self.consumer.clone();
        self.runner = Some(tokio::spawn(async move { consumer.run().await }));
        let broker = self.broker.clone();
        eventually("consumer registered", || {
            let broker = broker.clone();
            async move { broker.has_consumer("order-status") }
        })
        .await;
    }

    pub async fn publisher(&self) -> AmqpStatusPublisher {
        AmqpStatusPublisher::new(Arc::new(self.broker.clone()), self.records.clone()).await
    }

    /// Publish raw bytes onto the status exchange, bypassing the publisher
    pub async fn publish_raw(&self, body: &[u8]) {
        let channel = self.broker.channel().await.unwrap();
        channel
            .publish("orders", "order-status", body)
            .await
            .unwrap();
    }

    /// Current status of a stored order
    pub async fn stored_status(&self, order_id: &str) -> String {
        self.orders
            .find_by_id(order_id)
            .await
            .unwrap()
            .expect("order exists")
            .status
    }

    pub async fn shutdown(mut self) {
        self.consumer.close().await;
        if let Some(runner) = self.runner.take() {
            tokio::time::timeout(EVENTUALLY_TIMEOUT, runner)
                .await
                .expect("consumer did not stop")
                .expect("consumer task panicked");
        }
    }
}

/// Poll `check` until it holds, panicking after a few seconds
pub async fn eventually<F, Fut>(description: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(EVENTUALLY_POLL).await;
    }
}
