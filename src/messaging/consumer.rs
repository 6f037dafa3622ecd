//! # Status Consumer
//!
//! Pulls status events off the `order-status` queue one at a time (prefetch 1) and
//! settles each delivery according to what happened to it:
//!
//! | stage                         | outcome                              |
//! |-------------------------------|--------------------------------------|
//! | payload does not decode       | dead-lettered (`nack`, no requeue)   |
//! | use case fails permanently    | dead-lettered (`nack`, no requeue)   |
//! | use case fails transiently    | requeued (`nack`, requeue)           |
//! | use case succeeds             | acked                                |
//!
//! When the delivery stream ends (channel closed, broker restarted) the consumer
//! waits a fixed delay and registers again, until [`StatusConsumer::stop`] or
//! [`StatusConsumer::close`] is called. The stop signal is checked between
//! deliveries; a delivery that is being processed always finishes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::logging::log_delivery_outcome;
use crate::messaging::channel::{ChannelProvider, DeliveryStream, InboundDelivery};
use crate::messaging::errors::MessagingResult;
use crate::messaging::message::StatusEvent;
use crate::messaging::topology::{Topology, TopologyProvisioner};

/// Applies a decoded status event; implemented by the status transition use case
#[async_trait]
pub trait StatusMessageProcessor: Send + Sync {
    async fn process_status_message(&self, event: &StatusEvent) -> Result<()>;
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    DeadLettered,
    Requeued,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::DeadLettered => "dead_lettered",
            Self::Requeued => "requeued",
        }
    }
}

/// Running delivery counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
    settle_failures: AtomicU64,
    stream_restarts: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub settle_failures: u64,
    pub stream_restarts: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            stream_restarts: self.stream_restarts.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Acked => &self.acked,
            DeliveryOutcome::DeadLettered => &self.dead_lettered,
            DeliveryOutcome::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum StreamEnd {
    Stopped,
    Closed,
}

/// Consumer for the order-status work queue
pub struct StatusConsumer {
    provider: Arc<dyn ChannelProvider>,
    provisioner: TopologyProvisioner,
    processor: Arc<dyn StatusMessageProcessor>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for StatusConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusConsumer")
            .field("queue", &self.provisioner.topology().queue)
            .field("consumer_tag", &self.config.consumer_tag)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl StatusConsumer {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        processor: Arc<dyn StatusMessageProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self::with_topology(provider, processor, config, Topology::default())
    }

    pub fn with_topology(
        provider: Arc<dyn ChannelProvider>,
        processor: Arc<dyn StatusMessageProcessor>,
        config: ConsumerConfig,
        topology: Topology,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            provisioner: TopologyProvisioner::with_topology(provider.clone(), topology),
            provider,
            processor,
            config,
            stats: Arc::new(ConsumerStats::default()),
            shutdown_tx,
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    fn queue(&self) -> &str {
        &self.provisioner.topology().queue
    }

    /// Set QoS, make sure the topology exists and register on the work queue
    pub async fn start_consuming(&self) -> MessagingResult<DeliveryStream> {
        let channel = self.provider.channel().await?;
        channel.set_prefetch(self.config.prefetch_count).await?;
        self.provisioner.provision().await?;
        let stream = channel.consume(self.queue(), &self.config.consumer_tag).await?;

        info!(
            queue = %self.queue(),
            consumer_tag = %self.config.consumer_tag,
            prefetch = self.config.prefetch_count,
            "Started consuming"
        );
        Ok(stream)
    }

    /// Consume until stopped, re-registering whenever the stream ends
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !*shutdown_rx.borrow() {
            match self.start_consuming().await {
                Ok(stream) => {
                    if let StreamEnd::Stopped = self.drain(stream, &mut shutdown_rx).await {
                        break;
                    }
                    warn!(queue = %self.queue(), "Delivery stream closed");
                }
                Err(e) => {
                    warn!(queue = %self.queue(), error = %e, "Failed to start consuming");
                }
            }

            self.stats.stream_restarts.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.restart_delay()) => {}
            }
        }

        info!(queue = %self.queue(), "Status consumer stopped");
    }

    async fn drain(
        &self,
        mut stream: DeliveryStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            if *shutdown_rx.borrow() {
                return StreamEnd::Stopped;
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return StreamEnd::Stopped,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        self.handle_delivery(delivery).await;
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.queue(), error = %e, "Delivery stream error");
                        return StreamEnd::Closed;
                    }
                    None => return StreamEnd::Closed,
                },
            }
        }
    }

    /// Run one delivery through decode, apply and settle
    pub async fn handle_delivery(&self, delivery: InboundDelivery) -> DeliveryOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        info!(
            queue = %self.queue(),
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            body = %delivery.body_lossy(),
            "Received status message"
        );

        let event = match StatusEvent::from_bytes(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                let error = e.to_string();
                self.settle(&delivery, DeliveryOutcome::DeadLettered, None, Some(&error))
                    .await;
                return DeliveryOutcome::DeadLettered;
            }
        };

        let (outcome, error) = match self.processor.process_status_message(&event).await {
            Ok(()) => (DeliveryOutcome::Acked, None),
            Err(e) if e.is_permanent() => (DeliveryOutcome::DeadLettered, Some(e.to_string())),
            Err(e) => (DeliveryOutcome::Requeued, Some(e.to_string())),
        };

        self.settle(&delivery, outcome, Some(&event.order_id), error.as_deref())
            .await;
        outcome
    }

    async fn settle(
        &self,
        delivery: &InboundDelivery,
        outcome: DeliveryOutcome,
        order_id: Option<&str>,
        error: Option<&str>,
    ) {
        let result = match outcome {
            DeliveryOutcome::Acked => delivery.ack().await,
            DeliveryOutcome::DeadLettered => delivery.nack(false).await,
            DeliveryOutcome::Requeued => delivery.nack(true).await,
        };

        self.stats.record(outcome);
        log_delivery_outcome(
            self.queue(),
            delivery.delivery_tag,
            order_id,
            outcome.as_str(),
            error,
        );

        // The broker redelivers anything left unsettled once the channel drops
        if let Err(e) = result {
            self.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                delivery_tag = delivery.delivery_tag,
                outcome = outcome.as_str(),
                error = %e,
                "Failed to settle delivery"
            );
        }
    }

    /// Ask [`run`](Self::run) to return at the next iteration boundary
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop the loop and cancel the consumer registration, ignoring a missing channel
    pub async fn close(&self) {
        self.stop();
        match self.provider.channel().await {
            Ok(channel) => {
                if let Err(e) = channel.cancel(&self.config.consumer_tag).await {
                    debug!(error = %e, "Consumer cancel failed during close");
                }
            }
            Err(e) => debug!(error = %e, "No channel to cancel consumer on"),
        }
    }
}
