//! # Status Publisher
//!
//! Emits order-status events onto the `orders` exchange and records the outcome of
//! every attempt in the publication ledger, successful or not. The ledger write
//! happens after the publish result is known and never changes that result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::logging::log_publish_outcome;
use crate::messaging::channel::ChannelProvider;
use crate::messaging::errors::MessagingResult;
use crate::messaging::message::StatusEvent;
use crate::messaging::topology::{Topology, TopologyProvisioner};
use crate::models::PublicationRecord;
use crate::repository::PublicationRecordRepository;

/// Publish capability used by the order-mutation use cases
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish one status change; `timestamp` is epoch seconds
    async fn publish(&self, order_id: &str, status: &str, timestamp: f64) -> MessagingResult<()>;
}

/// [`StatusPublisher`] over an AMQP channel provider
pub struct AmqpStatusPublisher {
    provider: Arc<dyn ChannelProvider>,
    provisioner: TopologyProvisioner,
    records: Arc<dyn PublicationRecordRepository>,
    topology_ready: AtomicBool,
}

impl std::fmt::Debug for AmqpStatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpStatusPublisher")
            .field("topology", self.provisioner.topology())
            .field("topology_ready", &self.is_topology_ready())
            .finish()
    }
}

impl AmqpStatusPublisher {
    /// Build the publisher and try to provision the topology right away
    ///
    /// A provisioning failure is logged, not returned: the first publish retries it.
    pub async fn new(
        provider: Arc<dyn ChannelProvider>,
        records: Arc<dyn PublicationRecordRepository>,
    ) -> Self {
        Self::with_topology(provider, records, Topology::default()).await
    }

    pub async fn with_topology(
        provider: Arc<dyn ChannelProvider>,
        records: Arc<dyn PublicationRecordRepository>,
        topology: Topology,
    ) -> Self {
        let publisher = Self {
            provisioner: TopologyProvisioner::with_topology(provider.clone(), topology),
            provider,
            records,
            topology_ready: AtomicBool::new(false),
        };

        if let Err(e) = publisher.ensure_topology().await {
            warn!(error = %e, "Topology provisioning failed at startup, will retry on publish");
        }
        publisher
    }

    pub fn is_topology_ready(&self) -> bool {
        self.topology_ready.load(Ordering::Acquire)
    }

    async fn ensure_topology(&self) -> MessagingResult<()> {
        if self.is_topology_ready() {
            return Ok(());
        }
        self.provisioner.provision().await?;
        self.topology_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, event: &StatusEvent) -> MessagingResult<()> {
        let payload = event.to_bytes()?;
        self.ensure_topology().await?;

        let topology = self.provisioner.topology();
        let channel = self.provider.channel().await?;
        channel
            .publish(&topology.exchange, &topology.routing_key, &payload)
            .await
    }

    async fn record_outcome(&self, event: &StatusEvent, published: bool) {
        let record = PublicationRecord::new(
            event.order_id.as_str(),
            event.status.as_str(),
            published,
            event.timestamp,
        );

        match self.records.create(&record).await {
            Ok(()) => debug!(
                order_id = %event.order_id,
                record_id = %record.id,
                published = published,
                "Publication record written"
            ),
            Err(e) => warn!(
                order_id = %event.order_id,
                published = published,
                error = %e,
                "Failed to write publication record"
            ),
        }
    }
}

#[async_trait]
impl StatusPublisher for AmqpStatusPublisher {
    async fn publish(&self, order_id: &str, status: &str, timestamp: f64) -> MessagingResult<()> {
        let event = StatusEvent::new(order_id, status, timestamp);
        let result = self.send(&event).await;

        self.record_outcome(&event, result.is_ok()).await;

        let topology = self.provisioner.topology();
        let error = result.as_ref().err().map(ToString::to_string);
        log_publish_outcome(
            order_id,
            status,
            &topology.exchange,
            &topology.routing_key,
            result.is_ok(),
            error.as_deref(),
        );

        result
    }
}
