//! # Status Event Wire Format
//!
//! The JSON payload carried on the `orders` exchange. The publisher always writes
//! `{"order_id", "status", "ts"}` with `ts` as fractional epoch seconds. The consumer
//! additionally accepts a `timestamp` field holding either an RFC 3339 string or a
//! number, since older producers emitted that shape.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::messaging::errors::{MessagingError, MessagingResult};

/// Order-status change event exchanged through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStatusEvent")]
pub struct StatusEvent {
    /// Identifier of the order whose status changed
    pub order_id: String,
    /// Reported status label
    pub status: String,
    /// Epoch seconds (fractional) when the change happened
    #[serde(rename = "ts")]
    pub timestamp: f64,
}

impl StatusEvent {
    /// Create a new status event
    pub fn new(order_id: impl Into<String>, status: impl Into<String>, timestamp: f64) -> Self {
        Self {
            order_id: order_id.into(),
            status: status.into(),
            timestamp,
        }
    }

    /// Create a status event stamped with the current time
    pub fn now(order_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(order_id, status, epoch_seconds(Utc::now()))
    }

    /// Encode to the canonical JSON payload
    ///
    /// Non-finite timestamps are rejected: JSON has no representation for them and
    /// `serde_json` would silently emit `null`.
    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        if !self.timestamp.is_finite() {
            return Err(MessagingError::serialization(format!(
                "timestamp for order {} is not a finite number",
                self.order_id
            )));
        }
        serde_json::to_vec(self).map_err(|e| MessagingError::serialization(e.to_string()))
    }

    /// Decode a delivery body
    pub fn from_bytes(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| MessagingError::deserialization(e.to_string()))
    }

    /// Timestamp as a UTC datetime, if representable
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        from_epoch_seconds(self.timestamp)
    }
}

/// Fractional epoch seconds for a datetime
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) / 1e9
}

/// Datetime for fractional epoch seconds
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
}

/// Either shape of timestamp the consumer accepts
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(f64),
    Rfc3339(String),
}

/// Permissive intermediate form used for decoding
#[derive(Debug, Deserialize)]
struct RawStatusEvent {
    order_id: String,
    status: String,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    timestamp: Option<RawTimestamp>,
}

impl TryFrom<RawStatusEvent> for StatusEvent {
    type Error = String;

    fn try_from(raw: RawStatusEvent) -> Result<Self, Self::Error> {
        if raw.order_id.trim().is_empty() {
            return Err("order_id must not be empty".to_string());
        }
        if raw.status.trim().is_empty() {
            return Err("status must not be empty".to_string());
        }

        let timestamp = match (raw.ts, raw.timestamp) {
            (Some(ts), _) => ts,
            (None, Some(RawTimestamp::Seconds(seconds))) => seconds,
            (None, Some(RawTimestamp::Rfc3339(text))) => DateTime::parse_from_rfc3339(&text)
                .map(|parsed| epoch_seconds(parsed.with_timezone(&Utc)))
                .map_err(|e| format!("invalid RFC 3339 timestamp {text:?}: {e}"))?,
            // Producers that omit the time still carry a valid status change
            (None, None) => epoch_seconds(Utc::now()),
        };

        Ok(Self {
            order_id: raw.order_id,
            status: raw.status,
            timestamp,
        })
    }
}
