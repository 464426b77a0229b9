//! Platform error taxonomy
//!
//! Every library error maps onto one [`ErrorKind`], which decides how the
//! dispatch core and the role runtime react:
//!
//! | Kind                      | Reaction                                        |
//! |---------------------------|-------------------------------------------------|
//! | `LockBusy`                | expected contention, nack with backoff          |
//! | `LockLost`                | cancellation, nack (no commit happened)         |
//! | `TransportUnavailable`    | retried at the client layer, then unhealthy     |
//! | `CoordinationUnavailable` | retried at the client layer, then unhealthy     |
//! | `OperationFailed`         | retried up to `max_retries`, then dead-lettered |
//! | `ConfigInvalid`           | fatal at startup                                |

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockBusy,
    LockLost,
    TransportUnavailable,
    CoordinationUnavailable,
    OperationFailed,
    ConfigInvalid,
}

impl ErrorKind {
    /// Transient kinds are retried locally and never surface past the
    /// dispatch core.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::LockBusy
                | ErrorKind::LockLost
                | ErrorKind::TransportUnavailable
                | ErrorKind::CoordinationUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LockBusy => "lock_busy",
            ErrorKind::LockLost => "lock_lost",
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::CoordinationUnavailable => "coordination_unavailable",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::ConfigInvalid => "config_invalid",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by role specific work handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// May succeed on redelivery (counts against `max_retries`)
    Recoverable(String),

    /// Will never succeed; dead-lettered without further retries
    Permanent(String),
}

impl OperationError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        OperationError::Recoverable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        OperationError::Permanent(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::OperationFailed
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, OperationError::Permanent(_))
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Recoverable(msg) => write!(f, "operation failed: {msg}"),
            OperationError::Permanent(msg) => write!(f, "operation failed permanently: {msg}"),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<crate::storage::StorageError> for OperationError {
    fn from(err: crate::storage::StorageError) -> Self {
        OperationError::Recoverable(err.to_string())
    }
}
