//! Order Status Manager Binary
//!
//! Consumes order-status events from RabbitMQ and applies them to the order store.
//! Runs until Ctrl-C, then stops the consumer and closes the broker connection.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info};

use order_status::config::ConfigManager;
use order_status::logging::init_structured_logging;
use order_status::messaging::{BrokerConnection, StatusConsumer, TopologyProvisioner};
use order_status::repository::{PostgresOrderRepository, PostgresPublicationRecordRepository};
use order_status::services::StatusTransitionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let manager = ConfigManager::load().context("failed to load configuration")?;
    let config = manager.config();
    info!(
        environment = %manager.environment(),
        config_dir = %manager.config_directory().display(),
        broker = %config.broker.redacted_url(),
        "Starting order status manager"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout())
        .connect(&config.database.url)
        .await
        .context("failed to connect to PostgreSQL")?;

    if config.database.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;
        info!("Database migrations applied");
    }

    let connection = Arc::new(BrokerConnection::new(
        config.broker.clone(),
        config.publisher.confirm_publishes,
    ));
    connection
        .connect()
        .await
        .context("failed to connect to RabbitMQ")?;

    TopologyProvisioner::new(connection.clone())
        .provision()
        .await
        .context("failed to provision broker topology")?;

    let processor = Arc::new(StatusTransitionService::new(
        Arc::new(PostgresOrderRepository::new(pool.clone())),
        Arc::new(PostgresPublicationRecordRepository::new(pool.clone())),
    ));
    let consumer = Arc::new(StatusConsumer::new(
        connection.clone(),
        processor,
        config.consumer.clone(),
    ));

    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };
    info!("Consumer running, press Ctrl-C to stop");

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    consumer.close().await;
    if let Err(e) = runner.await {
        error!(error = %e, "Consumer task ended abnormally");
    }
    info!(stats = ?consumer.stats().snapshot(), "Consumer stopped");

    connection
        .close()
        .await
        .context("failed to close broker connection")?;
    pool.close().await;
    info!("Order status manager stopped");

    Ok(())
}
