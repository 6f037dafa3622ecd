//! # Messaging Module
//!
//! RabbitMQ-based order-status messaging: connection lifecycle with automatic
//! reconnection, topology provisioning, the audited status publisher and the
//! dead-lettering status consumer.

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod publisher;
pub mod topology;

pub use channel::{
    BrokerChannel, ChannelProvider, DeliveryAcker, DeliveryStream, ExchangeType, InboundDelivery,
    LapinChannel,
};
pub use connection::{BrokerConnection, BrokerDialer, BrokerSession, FailureHook, LapinDialer};
pub use consumer::{
    ConsumerStats, ConsumerStatsSnapshot, DeliveryOutcome, StatusConsumer, StatusMessageProcessor,
};
pub use errors::{MessagingError, MessagingResult};
pub use in_memory::{InMemoryBroker, Settlement, SettlementRecord};
pub use message::StatusEvent;
pub use publisher::{AmqpStatusPublisher, StatusPublisher};
pub use topology::{Topology, TopologyProvisioner};
