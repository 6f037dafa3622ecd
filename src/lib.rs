#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, PostgreSQL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Order Status Pipeline
//!
//! Durable, at-least-once propagation of order status changes over RabbitMQ.
//!
//! ## Overview
//!
//! The producer side commits an order change to PostgreSQL, publishes a
//! [`StatusEvent`] to a durable direct exchange, and records every attempt in a
//! publication ledger. The consumer side reads the work queue one message at a
//! time, applies the status to the order, reconciles the ledger, and settles the
//! delivery: success is acknowledged, poison messages go to the dead-letter
//! queue, and transient failures are requeued.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Broker connection, topology, publisher and consumer
//! - [`services`] - Order use cases and the status transition applied per event
//! - [`repository`] - Order store and publication ledger behind async traits
//! - [`models`] - Orders, status vocabulary and publication records
//! - [`config`] - Layered TOML and environment configuration
//! - [`resilience`] - Reconnection policy
//! - [`logging`] - Structured console and file logging
//! - [`error`] - Pipeline and storage errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use order_status::messaging::{InMemoryBroker, StatusConsumer};
//! use order_status::repository::{InMemoryOrderRepository, InMemoryPublicationRecordRepository};
//! use order_status::services::StatusTransitionService;
//! use order_status::config::ConsumerConfig;
//!
//! # async fn example() {
//! let broker = InMemoryBroker::new();
//! let orders = Arc::new(InMemoryOrderRepository::new());
//! let records = Arc::new(InMemoryPublicationRecordRepository::new());
//! let processor = Arc::new(StatusTransitionService::new(orders, records));
//!
//! let consumer = StatusConsumer::new(Arc::new(broker), processor, ConsumerConfig::default());
//! consumer.run().await;
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod repository;
pub mod resilience;
pub mod services;
pub mod test_utils;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{PipelineError, Result, StorageError};
pub use messaging::{
    AmqpStatusPublisher, BrokerConnection, MessagingError, StatusConsumer, StatusEvent,
    StatusPublisher,
};
pub use models::{Order, OrderItem, OrderStatus, PublicationRecord};
pub use services::{OrderService, StatusTransitionService};
