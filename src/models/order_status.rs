//! # Order Status Vocabulary
//!
//! Orders move through four lifecycle stages. Deployments label them either with the
//! canonical English names or with the Portuguese/Spanish labels the order API has
//! always written (`criado`, `em_processamento`, `enviado`, `entregue`). Labels are
//! stored verbatim; [`OrderStatus`] only classifies them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Lifecycle stage of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Processing,
    Shipped,
    Delivered,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::Created,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    /// Canonical English label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
        }
    }

    /// Classify a reported label, accepting every alias in use
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "created" | "criado" | "criada" | "creada" => Some(Self::Created),
            "processing" | "em_processamento" => Some(Self::Processing),
            "shipped" | "enviado" => Some(Self::Shipped),
            "delivered" | "entregue" => Some(Self::Delivered),
            _ => None,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| PipelineError::InvalidStatus {
            status: s.to_string(),
        })
    }
}

/// Status the consumer applies for a reported status
///
/// Creation signals advance the order out of its initial state: `created`/`creada`
/// become `processing`, the Portuguese `criado`/`criada` become `em_processamento`.
/// The consumer never writes an initial status back. Everything else, including
/// labels outside the vocabulary, is applied verbatim.
pub fn normalize_status(reported: &str) -> String {
    match reported {
        "created" | "creada" => OrderStatus::Processing.as_str().to_string(),
        "criado" | "criada" => "em_processamento".to_string(),
        other => other.to_string(),
    }
}
