//! # Pipeline Constants
//!
//! Fixed broker topology names and operational defaults shared by the publisher and
//! consumer sides of the order-status pipeline. Both services must agree on these
//! values.

/// Broker topology names (exchanges, queues, routing keys)
pub mod topology {
    /// Direct exchange that carries order-status events
    pub const STATUS_EXCHANGE: &str = "orders";
    /// Work queue consumed by the status manager
    pub const STATUS_QUEUE: &str = "order-status";
    /// Routing key binding the work queue to the status exchange
    pub const STATUS_ROUTING_KEY: &str = "order-status";
    /// Fanout exchange receiving rejected (dead-lettered) messages
    pub const DEAD_LETTER_EXCHANGE: &str = "orders.dlx";
    /// Queue collecting everything routed through the dead-letter exchange
    pub const DEAD_LETTER_QUEUE: &str = "order-status.dlq";
    /// Queue argument naming the dead-letter exchange
    pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
}

/// Message-level constants
pub mod message {
    /// Content type stamped on every published status event
    pub const CONTENT_TYPE_JSON: &str = "application/json";
    /// AMQP delivery mode 2 = persistent
    pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
}

/// Operational defaults
pub mod defaults {
    /// Consumer tag registered by the status manager
    pub const CONSUMER_TAG: &str = "manager-status-consumer";
    /// Connection name shown in the broker management UI
    pub const CONNECTION_NAME: &str = "order-status-pipeline";
    /// Unacknowledged deliveries allowed per channel
    pub const PREFETCH_COUNT: u16 = 1;
    /// Reconnect attempts before the monitor gives up
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    /// Fixed delay between reconnect attempts
    pub const RECONNECT_DELAY_SECONDS: u64 = 5;
    /// Delay before re-opening a closed delivery stream
    pub const CONSUMER_RESTART_DELAY_SECONDS: u64 = 5;
}

