//! # Publication Record Model
//!
//! Audit ledger entry answering "was this status change ever handed to the broker".
//! The publisher appends one per publish attempt; the consumer creates one (or flips
//! the latest to published) when it applies an event.
//!
//! Maps to the `publication_records` table:
//! ```sql
//! CREATE TABLE publication_records (
//!   id UUID PRIMARY KEY,
//!   order_id TEXT NOT NULL,
//!   published BOOLEAN NOT NULL,
//!   order_status TEXT NOT NULL,
//!   ts DOUBLE PRECISION NOT NULL,
//!   published_at TIMESTAMPTZ NOT NULL
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PublicationRecord {
    pub id: Uuid,
    pub order_id: String,
    pub published: bool,
    pub order_status: String,
    /// Epoch seconds of the status change the record describes
    #[serde(rename = "ts")]
    #[sqlx(rename = "ts")]
    pub timestamp: f64,
    /// When the record was written or last flipped
    pub published_at: DateTime<Utc>,
}

impl PublicationRecord {
    pub fn new(
        order_id: impl Into<String>,
        order_status: impl Into<String>,
        published: bool,
        timestamp: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.into(),
            published,
            order_status: order_status.into(),
            timestamp,
            published_at: Utc::now(),
        }
    }
}
