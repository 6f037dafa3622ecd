//! # In-Memory Broker
//!
//! A [`ChannelProvider`] that behaves like a single RabbitMQ node closely enough to
//! run the publisher and consumer end to end without one: durable-style exchanges
//! (direct and fanout), queue bindings, consumer registrations fed through delivery
//! streams, ack/nack with requeue and dead-lettering through the queue's
//! `x-dead-letter-exchange`.
//!
//! State sits behind a `parking_lot::Mutex` that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::messaging::channel::{
    BrokerChannel, ChannelProvider, DeliveryAcker, DeliveryStream, ExchangeType, InboundDelivery,
};
use crate::messaging::errors::{MessagingError, MessagingResult};

/// How a delivery was settled by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected,
}

/// A settled delivery, as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub settlement: Settlement,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

type DeliverySender = mpsc::UnboundedSender<MessagingResult<InboundDelivery>>;

#[derive(Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, QueuedMessage>,
    consumer: Option<(String, DeliverySender)>,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    /// (queue, exchange, routing key)
    bindings: Vec<(String, String, String)>,
    next_delivery_tag: u64,
    prefetch: Option<u16>,
    fail_publishes: bool,
    published: u64,
    settlements: Vec<SettlementRecord>,
}

/// Shared handle; clones see the same broker
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("connected", &state.connected)
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A connected broker with nothing declared
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Drop the connection: open delivery streams end, unacked messages return to
    /// their queues flagged as redelivered, and channel lookups fail
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        for queue in state.queues.values_mut() {
            queue.consumer = None;
            let mut returned: Vec<(u64, QueuedMessage)> = queue.unacked.drain().collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }

    pub fn reconnect(&self) {
        self.state.lock().connected = true;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Make every publish fail with a broker-side error
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    pub fn exchange_type(&self, name: &str) -> Option<ExchangeType> {
        self.state.lock().exchanges.get(name).copied()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone())
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state
            .lock()
            .bindings
            .iter()
            .any(|(q, e, k)| q == queue && e == exchange && k == routing_key)
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Bodies waiting in a queue, oldest first
    pub fn queued_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().prefetch
    }

    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state.lock().settlements.clone()
    }

    fn channel_handle(&self) -> InMemoryChannel {
        InMemoryChannel {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl ChannelProvider for InMemoryBroker {
    async fn channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }
        Ok(Arc::new(self.channel_handle()))
    }
}

struct InMemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryChannel {
    fn lock_open(&self) -> MessagingResult<parking_lot::MutexGuard<'_, BrokerState>> {
        let state = self.state.lock();
        if !state.connected {
            return Err(MessagingError::ChannelClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> MessagingResult<()> {
        let mut state = self.lock_open()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(MessagingError::topology(
                name,
                format!("PRECONDITION_FAILED - inequivalent type {existing:?}, requested {kind:?}"),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> MessagingResult<()> {
        let mut state = self.lock_open()?;
        let requested = dead_letter_exchange.map(str::to_string);
        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange != requested => {
                Err(MessagingError::topology(
                    name,
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange'",
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange: requested,
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        let mut state = self.lock_open()?;
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::topology(queue, "NOT_FOUND - no queue"));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::topology(exchange, "NOT_FOUND - no exchange"));
        }
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> MessagingResult<()> {
        let mut state = self.lock_open()?;
        if state.fail_publishes {
            return Err(MessagingError::publish(
                exchange,
                routing_key,
                "broker rejected the publish",
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::publish(
                exchange,
                routing_key,
                "NOT_FOUND - no exchange",
            ));
        }
        state.published += 1;
        let message = QueuedMessage {
            body: payload.to_vec(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        let state_arc = self.state.clone();
        route(&mut state, &state_arc, exchange, message);
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.lock_open()?.prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream> {
        let mut state = self.lock_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| MessagingError::consume(queue, "NOT_FOUND - no queue"))?;
            queue_state.consumer = Some((consumer_tag.to_string(), tx));
        }
        let state_arc = self.state.clone();
        drain_ready(&mut state, &state_arc, queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        let mut state = self.lock_open()?;
        for queue in state.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|(tag, _)| tag == consumer_tag)
            {
                queue.consumer = None;
            }
        }
        Ok(())
    }
}

/// Deliver a message to every queue the exchange routes it to
fn route(
    state: &mut BrokerState,
    state_arc: &Arc<Mutex<BrokerState>>,
    exchange: &str,
    message: QueuedMessage,
) {
    let fanout = matches!(state.exchanges.get(exchange), Some(ExchangeType::Fanout));
    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|(_, e, key)| e == exchange && (fanout || *key == message.routing_key))
        .map(|(queue, _, _)| queue.clone())
        .collect();

    for queue in targets {
        if let Some(queue_state) = state.queues.get_mut(&queue) {
            queue_state.ready.push_back(message.clone());
        }
        drain_ready(state, state_arc, &queue);
    }
}

/// Push ready messages to the queue's consumer, if one is registered, without
/// exceeding the prefetch window
fn drain_ready(state: &mut BrokerState, state_arc: &Arc<Mutex<BrokerState>>, queue: &str) {
    let window = state.prefetch.filter(|p| *p > 0).map(usize::from);
    loop {
        let next_tag = state.next_delivery_tag + 1;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return;
        };
        if queue_state.consumer.is_none() {
            return;
        }
        if window.is_some_and(|limit| queue_state.unacked.len() >= limit) {
            return;
        }
        let Some(message) = queue_state.ready.pop_front() else {
            return;
        };

        let delivery = InboundDelivery::new(
            next_tag,
            message.redelivered,
            message.body.clone(),
            Box::new(InMemoryAcker {
                state: state_arc.clone(),
                queue: queue.to_string(),
                delivery_tag: next_tag,
            }),
        );

        let sent = queue_state
            .consumer
            .as_ref()
            .is_some_and(|(_, sender)| sender.send(Ok(delivery)).is_ok());
        if !sent {
            // Stream dropped; keep the message and forget the dead registration
            queue_state.ready.push_front(message);
            queue_state.consumer = None;
            return;
        }
        queue_state.unacked.insert(next_tag, message);
        state.next_delivery_tag = next_tag;
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, settlement: Settlement) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(MessagingError::acknowledgement(
                self.delivery_tag,
                "channel closed",
            ));
        }

        let message = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.delivery_tag))
            .ok_or_else(|| {
                MessagingError::acknowledgement(self.delivery_tag, "unknown delivery tag")
            })?;

        state.settlements.push(SettlementRecord {
            queue: self.queue.clone(),
            delivery_tag: self.delivery_tag,
            body: message.body.clone(),
            settlement: settlement.clone(),
        });

        let state_arc = self.state.clone();
        match settlement {
            Settlement::Acked => {}
            Settlement::Requeued => {
                if let Some(queue_state) = state.queues.get_mut(&self.queue) {
                    queue_state.ready.push_front(QueuedMessage {
                        redelivered: true,
                        ..message
                    });
                }
            }
            Settlement::Rejected => {
                let dlx = state
                    .queues
                    .get(&self.queue)
                    .and_then(|q| q.dead_letter_exchange.clone());
                // Without a dead-letter exchange a rejected message is discarded
                if let Some(dlx) = dlx {
                    route(&mut state, &state_arc, &dlx, message);
                }
            }
        }
        // The settled tag freed a slot in the prefetch window
        drain_ready(&mut state, &state_arc, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.settle(Settlement::Acked)
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        if requeue {
            self.settle(Settlement::Requeued)
        } else {
            self.settle(Settlement::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::topology::{declare_topology, Topology};

    async fn provisioned() -> (InMemoryBroker, Arc<dyn BrokerChannel>) {
        let broker = InMemoryBroker::new();
        let channel = broker.channel().await.unwrap();
        declare_topology(channel.as_ref(), &Topology::default())
            .await
            .unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn test_direct_routing_and_dead_lettering() {
        let (broker, channel) = provisioned().await;

        channel.publish("orders", "order-status", b"one").await.unwrap();
        channel.publish("orders", "other-key", b"unroutable").await.unwrap();
        assert_eq!(broker.queued_messages("order-status"), vec![b"one".to_vec()]);

        let mut stream = channel.consume("order-status", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("order-status"), 1);

        delivery.nack(false).await.unwrap();
        assert_eq!(broker.unacked_count("order-status"), 0);
        assert_eq!(
            broker.queued_messages("order-status.dlq"),
            vec![b"one".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_flag() {
        let (broker, channel) = provisioned().await;
        let mut stream = channel.consume("order-status", "test").await.unwrap();

        channel.publish("orders", "order-status", b"retry").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"retry".to_vec());
        second.ack().await.unwrap();

        let outcomes: Vec<Settlement> = broker
            .settlements()
            .into_iter()
            .map(|s| s.settlement)
            .collect();
        assert_eq!(outcomes, vec![Settlement::Requeued, Settlement::Acked]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams_and_returns_unacked() {
        let (broker, channel) = provisioned().await;
        let mut stream = channel.consume("order-status", "test").await.unwrap();
        channel.publish("orders", "order-status", b"inflight").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.disconnect();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            broker.channel().await,
            Err(MessagingError::NotConnected)
        ));
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.queue_depth("order-status"), 1);

        broker.reconnect();
        let channel = broker.channel().await.unwrap();
        let mut stream = channel.consume("order-status", "test").await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_prefetch_window_holds_back_deliveries() {
        let (broker, channel) = provisioned().await;
        channel.set_prefetch(1).await.unwrap();
        channel.publish("orders", "order-status", b"first").await.unwrap();
        channel.publish("orders", "order-status", b"second").await.unwrap();

        let mut stream = channel.consume("order-status", "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("order-status"), 1);
        assert_eq!(broker.queue_depth("order-status"), 1);

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"second".to_vec());
        assert_eq!(broker.queue_depth("order-status"), 0);
    }

    #[tokio::test]
    async fn test_inequivalent_redeclare_fails() {
        let (_broker, channel) = provisioned().await;
        assert!(channel
            .declare_exchange("orders", ExchangeType::Fanout)
            .await
            .is_err());
        assert!(channel.declare_queue("order-status", None).await.is_err());
        assert!(channel
            .declare_queue("order-status", Some("orders.dlx"))
            .await
            .is_ok());
    }
}
