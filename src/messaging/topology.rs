//! # Topology Provisioning
//!
//! Declares the exchanges and queues the pipeline routes through:
//!
//! ```text
//! orders (direct) --order-status--> order-status --nack(requeue=false)--> orders.dlx (fanout) --> order-status.dlq
//! ```
//!
//! Every declaration is durable and idempotent, so the publisher and the consumer
//! both provision at startup without coordinating.

use std::sync::Arc;

use tracing::{debug, info};

use crate::constants::topology;
use crate::messaging::channel::{BrokerChannel, ChannelProvider, ExchangeType};
use crate::messaging::errors::MessagingResult;

/// Names of every exchange, queue and routing key in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: topology::STATUS_EXCHANGE.to_string(),
            queue: topology::STATUS_QUEUE.to_string(),
            routing_key: topology::STATUS_ROUTING_KEY.to_string(),
            dead_letter_exchange: topology::DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: topology::DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// Declares [`Topology`] on whatever channel the provider currently hands out
#[derive(Clone)]
pub struct TopologyProvisioner {
    provider: Arc<dyn ChannelProvider>,
    topology: Topology,
}

impl std::fmt::Debug for TopologyProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyProvisioner")
            .field("topology", &self.topology)
            .finish()
    }
}

impl TopologyProvisioner {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self::with_topology(provider, Topology::default())
    }

    pub fn with_topology(provider: Arc<dyn ChannelProvider>, topology: Topology) -> Self {
        Self { provider, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare everything on the current channel
    pub async fn provision(&self) -> MessagingResult<()> {
        let channel = self.provider.channel().await?;
        declare_topology(channel.as_ref(), &self.topology).await?;

        info!(
            exchange = %self.topology.exchange,
            queue = %self.topology.queue,
            dead_letter_queue = %self.topology.dead_letter_queue,
            "Broker topology provisioned"
        );
        Ok(())
    }
}

/// Declare the dead-letter pair first so the work queue's argument points at an
/// existing exchange, then the status exchange and work queue
pub async fn declare_topology(
    channel: &dyn BrokerChannel,
    topology: &Topology,
) -> MessagingResult<()> {
    channel
        .declare_exchange(&topology.dead_letter_exchange, ExchangeType::Fanout)
        .await?;
    channel.declare_queue(&topology.dead_letter_queue, None).await?;
    // Fanout ignores the key
    channel
        .bind_queue(&topology.dead_letter_queue, &topology.dead_letter_exchange, "")
        .await?;
    debug!(dlx = %topology.dead_letter_exchange, "Dead-letter exchange declared");

    channel
        .declare_exchange(&topology.exchange, ExchangeType::Direct)
        .await?;
    channel
        .declare_queue(&topology.queue, Some(&topology.dead_letter_exchange))
        .await?;
    channel
        .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
        .await?;

    Ok(())
}
