//! # Topology Provisioning Tests

use std::sync::Arc;

use order_status::messaging::{
    ChannelProvider, ExchangeType, InMemoryBroker, MessagingError, Topology, TopologyProvisioner,
};

#[tokio::test]
async fn test_provisioning_declares_work_and_dead_letter_routes() {
    let broker = InMemoryBroker::new();
    TopologyProvisioner::new(Arc::new(broker.clone()))
        .provision()
        .await
        .unwrap();

    assert_eq!(broker.exchange_type("orders"), Some(ExchangeType::Direct));
    assert_eq!(broker.exchange_type("orders.dlx"), Some(ExchangeType::Fanout));
    assert!(broker.is_bound("order-status", "orders", "order-status"));
    assert!(broker.is_bound("order-status.dlq", "orders.dlx", ""));
    assert_eq!(
        broker.dead_letter_exchange("order-status").as_deref(),
        Some("orders.dlx")
    );
    assert_eq!(broker.dead_letter_exchange("order-status.dlq"), None);
}

#[tokio::test]
async fn test_provisioning_twice_is_harmless() {
    let broker = InMemoryBroker::new();
    let provisioner = TopologyProvisioner::new(Arc::new(broker.clone()));

    provisioner.provision().await.unwrap();
    let bindings = broker.binding_count();
    provisioner.provision().await.unwrap();

    assert_eq!(broker.binding_count(), bindings);
}

#[tokio::test]
async fn test_conflicting_existing_queue_fails_provisioning() {
    let broker = InMemoryBroker::new();
    let channel = broker.channel().await.unwrap();
    channel.declare_queue("order-status", None).await.unwrap();

    let err = TopologyProvisioner::new(Arc::new(broker.clone()))
        .provision()
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Topology { .. }));
}

#[tokio::test]
async fn test_provisioning_without_connection_fails() {
    let broker = InMemoryBroker::new();
    broker.disconnect();

    let err = TopologyProvisioner::new(Arc::new(broker))
        .provision()
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NotConnected));
}

#[tokio::test]
async fn test_custom_topology_names() {
    let broker = InMemoryBroker::new();
    let topology = Topology {
        exchange: "shop.orders".to_string(),
        queue: "shop.order-status".to_string(),
        routing_key: "status".to_string(),
        dead_letter_exchange: "shop.dlx".to_string(),
        dead_letter_queue: "shop.dlq".to_string(),
    };
    TopologyProvisioner::with_topology(Arc::new(broker.clone()), topology)
        .provision()
        .await
        .unwrap();

    assert!(broker.is_bound("shop.order-status", "shop.orders", "status"));
    assert!(!broker.has_queue("order-status"));
}
