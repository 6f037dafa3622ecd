//! # Resilience Module
//!
//! Recovery behaviour for broker outages. The connection monitor uses
//! [`ReconnectPolicy`] to decide how often, and how long apart, it re-dials after
//! the broker drops the connection.

pub mod reconnect;

pub use reconnect::ReconnectPolicy;
