//! Error types for coordination operations

use std::fmt;

use crate::error::ErrorKind;
use crate::retry::Classify;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur while talking to the coordination backend
///
/// Contention (`Busy`) and lease loss (`Lost`) are regular outcomes of
/// [`Acquire`](super::Acquire) and [`Renewal`](super::Renewal), not errors.
#[derive(Debug)]
pub enum CoordinationError {
    /// Backend not reachable (connection refused, timeout, busy database)
    Unavailable(String),

    /// Backend answered with something we cannot use
    Backend(String),

    /// Invalid endpoint or key
    InvalidRequest(String),
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::Unavailable(msg) => {
                write!(f, "coordination backend unavailable: {}", msg)
            }
            CoordinationError::Backend(msg) => write!(f, "coordination backend error: {}", msg),
            CoordinationError::InvalidRequest(msg) => {
                write!(f, "invalid coordination request: {}", msg)
            }
        }
    }
}

impl std::error::Error for CoordinationError {}

impl Classify for CoordinationError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoordinationError::Unavailable(_) => ErrorKind::CoordinationUnavailable,
            CoordinationError::Backend(_) => ErrorKind::CoordinationUnavailable,
            CoordinationError::InvalidRequest(_) => ErrorKind::ConfigInvalid,
        }
    }
}

impl From<sqlx::Error> for CoordinationError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                CoordinationError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) if crate::storage::sqlite::is_busy(db.as_ref()) => {
                CoordinationError::Unavailable(err.to_string())
            }
            _ => CoordinationError::Backend(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoordinationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            CoordinationError::Unavailable(err.to_string())
        } else {
            CoordinationError::Backend(err.to_string())
        }
    }
}

impl From<crate::storage::StorageError> for CoordinationError {
    fn from(err: crate::storage::StorageError) -> Self {
        CoordinationError::Unavailable(err.to_string())
    }
}
