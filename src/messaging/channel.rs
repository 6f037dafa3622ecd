//! # Broker Channel Abstractions
//!
//! Capability traits separating the pipeline from the AMQP client. The publisher,
//! topology provisioner and consumer only ever talk to a [`BrokerChannel`] obtained
//! from a [`ChannelProvider`]; production wires in [`LapinChannel`] through
//! [`BrokerConnection`](crate::messaging::BrokerConnection), tests wire in the
//! [`InMemoryBroker`](crate::messaging::InMemoryBroker).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};

use crate::constants::{message, topology};
use crate::messaging::errors::{MessagingError, MessagingResult};

/// Exchange routing behaviour used by the pipeline topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Route on exact routing-key match
    Direct,
    /// Route to every bound queue, ignoring the routing key
    Fanout,
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
        }
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positive acknowledgement
    async fn ack(&self) -> MessagingResult<()>;

    /// Negative acknowledgement; `requeue = false` routes to the dead-letter exchange
    async fn nack(&self, requeue: bool) -> MessagingResult<()>;
}

/// A message pulled from a queue, not yet settled
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl InboundDelivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> MessagingResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.acker.nack(requeue).await
    }

    /// Body rendered for logs; invalid UTF-8 is replaced rather than dropped
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer registration
///
/// The stream ending (or yielding an error) means the registration is gone and the
/// caller has to consume again.
pub type DeliveryStream = BoxStream<'static, MessagingResult<InboundDelivery>>;

/// The AMQP operations the pipeline needs from a channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> MessagingResult<()>;

    /// Declare a durable queue, optionally dead-lettering into `dead_letter_exchange`
    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> MessagingResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> MessagingResult<()>;

    /// Publish a persistent JSON message
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
        -> MessagingResult<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()>;
}

/// Hands out the channel that is current right now
///
/// Implementations must fail with [`MessagingError::NotConnected`] while no
/// connection is established. Callers should fetch a channel per operation instead
/// of holding one across idle periods.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>>;
}

/// [`BrokerChannel`] backed by a lapin channel
#[derive(Debug, Clone)]
pub struct LapinChannel {
    channel: Channel,
    confirm_publishes: bool,
}

impl LapinChannel {
    /// Wrap an open channel; `confirm_publishes` must match whether
    /// `confirm_select` was issued on it
    pub fn new(channel: Channel, confirm_publishes: bool) -> Self {
        Self {
            channel,
            confirm_publishes,
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    /// Register a callback for channel-level errors (e.g. a broker-side close)
    pub(crate) fn on_error<F>(&self, handler: F)
    where
        F: FnMut(lapin::Error) + Send + 'static,
    {
        self.channel.on_error(handler);
    }

    pub(crate) async fn close(&self) -> MessagingResult<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| MessagingError::transport(format!("channel close failed: {e}")))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> MessagingResult<()> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(name, format!("exchange declare failed: {e}")))
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> MessagingResult<()> {
        let mut args = FieldTable::default();
        if let Some(dlx) = dead_letter_exchange {
            args.insert(
                topology::DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(dlx.into()),
            );
        }

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::topology(name, format!("queue declare failed: {e}")))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::topology(queue, format!("bind to {exchange} failed: {e}"))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> MessagingResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(message::DELIVERY_MODE_PERSISTENT)
                    .with_content_type(message::CONTENT_TYPE_JSON.into()),
            )
            .await
            .map_err(|e| MessagingError::publish(exchange, routing_key, e.to_string()))?;

        let confirmation = confirm.await.map_err(|e| {
            MessagingError::publish(exchange, routing_key, format!("confirmation failed: {e}"))
        })?;

        if self.confirm_publishes && confirmation.is_nack() {
            return Err(MessagingError::publish(
                exchange,
                routing_key,
                "broker negatively acknowledged the message",
            ));
        }

        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::connection(format!("failed to set QoS: {e}")))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue, e.to_string()))?;

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(InboundDelivery::new(
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.data,
                Box::new(LapinAcker {
                    acker: delivery.acker,
                    delivery_tag: delivery.delivery_tag,
                }),
            )),
            Err(e) => Err(MessagingError::consume(&queue, e.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(MessagingError::from)
    }
}

/// Settles lapin deliveries through the delivery's own acker
struct LapinAcker {
    acker: Acker,
    delivery_tag: u64,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::acknowledgement(self.delivery_tag, e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::acknowledgement(self.delivery_tag, e.to_string()))
    }
}
