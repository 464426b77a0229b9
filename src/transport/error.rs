//! Error types for transport operations

use std::fmt;

use crate::error::ErrorKind;
use crate::retry::Classify;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug)]
pub enum TransportError {
    /// Broker not reachable (connection refused, busy database)
    Unavailable(String),

    /// Broker answered with something we cannot use
    Backend(String),

    /// Message body could not be (de)serialized
    Serialization(String),

    /// Invalid URL or queue name
    InvalidRequest(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unavailable(msg) => write!(f, "transport unavailable: {}", msg),
            TransportError::Backend(msg) => write!(f, "transport backend error: {}", msg),
            TransportError::Serialization(msg) => {
                write!(f, "message serialization error: {}", msg)
            }
            TransportError::InvalidRequest(msg) => {
                write!(f, "invalid transport request: {}", msg)
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Unavailable(_) | TransportError::Backend(_) => {
                ErrorKind::TransportUnavailable
            }
            TransportError::Serialization(_) => ErrorKind::OperationFailed,
            TransportError::InvalidRequest(_) => ErrorKind::ConfigInvalid,
        }
    }
}

impl From<sqlx::Error> for TransportError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                TransportError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) if crate::storage::sqlite::is_busy(db.as_ref()) => {
                TransportError::Unavailable(err.to_string())
            }
            _ => TransportError::Backend(err.to_string()),
        }
    }
}

impl From<crate::storage::StorageError> for TransportError {
    fn from(err: crate::storage::StorageError) -> Self {
        TransportError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}
