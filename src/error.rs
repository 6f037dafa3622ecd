use thiserror::Error;

use crate::messaging::MessagingError;

/// Persistence-layer failures (order store and publication ledger)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Record conflict: {message}")]
    Conflict { message: String },

    #[error("Failed to decode stored {entity}: {message}")]
    Decode { entity: String, message: String },
}

impl StorageError {
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn decode(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StorageError::Conflict {
                    message: db_err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { index, source } => {
                StorageError::decode(index, source.to_string())
            }
            sqlx::Error::Decode(source) => StorageError::decode("row", source.to_string()),
            other => StorageError::database("query", other.to_string()),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Top-level error for the publish operation and the order use cases
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("invalid order id {order_id:?}: {reason}")]
    InvalidOrderId { order_id: String, reason: String },

    #[error("invalid order status {status:?}")]
    InvalidStatus { status: String },

    #[error("invalid order request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        Self::OrderNotFound {
            order_id: order_id.into(),
        }
    }

    /// Whether redelivering the same message can never succeed
    ///
    /// Drives the consumer's dead-letter versus requeue decision: missing orders,
    /// unparseable identifiers and undecodable payloads are permanent, storage and
    /// broker hiccups are not.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::OrderNotFound { .. }
            | Self::InvalidOrderId { .. }
            | Self::InvalidStatus { .. }
            | Self::InvalidRequest(_) => true,
            Self::Messaging(err) => !err.is_transient(),
            Self::Storage(_) | Self::Configuration(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(PipelineError::order_not_found("ffffffffffffffffffffffff").is_permanent());
        assert!(PipelineError::InvalidOrderId {
            order_id: "".to_string(),
            reason: "empty".to_string()
        }
        .is_permanent());
        assert!(
            PipelineError::from(MessagingError::deserialization("bad json")).is_permanent()
        );

        assert!(!PipelineError::from(StorageError::database("update", "timeout")).is_permanent());
        assert!(!PipelineError::from(MessagingError::NotConnected).is_permanent());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::order_not_found("abc");
        assert_eq!(err.to_string(), "order not found: abc");

        let err = PipelineError::from(StorageError::database("find order", "pool closed"));
        assert_eq!(err.to_string(), "Database error during find order: pool closed");
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StorageError::Database { .. }));
    }
}
