//! Coordinator trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::CoordinationResult;

/// Proof of a held lock
///
/// The `token` fences the handle: a lock that expired and was re-acquired by
/// anyone else carries a different token, so a stale handle can neither renew
/// nor release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub owner: String,
    pub token: String,

    /// Lease expiry as last confirmed by the backend
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`Coordinator::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(LockHandle),

    /// A live lease is held by another owner
    Busy { holder: Option<String> },
}

impl Acquire {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquire::Acquired(_))
    }
}

/// Outcome of [`Coordinator::renew`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed { expires_at: DateTime<Utc> },

    /// The lease expired and the record is gone or belongs to someone else.
    /// Work guarded by the handle must be aborted.
    Lost,
}

/// Live lock record as visible to every instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Lease based distributed lock service
///
/// Implementations must make `acquire` an atomic check-and-set against the
/// shared backend: at most one non-expired record per key may exist across all
/// processes. Locks are re-entrant per owner string; callers that need
/// session-level exclusivity use a distinct owner per session.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Try to take `key` for `owner` for `lease`
    ///
    /// Succeeds when no record exists, the existing lease has expired, or the
    /// record already belongs to `owner` (in which case the lease is extended
    /// and the existing token kept).
    async fn acquire(&self, key: &str, owner: &str, lease: Duration)
    -> CoordinationResult<Acquire>;

    /// Extend a held lease
    async fn renew(&self, handle: &LockHandle, lease: Duration) -> CoordinationResult<Renewal>;

    /// Delete the record if it still belongs to `handle`
    ///
    /// Safe to call after the lease expired or after a previous release.
    async fn release(&self, handle: &LockHandle) -> CoordinationResult<()>;

    /// Current live holder of `key`, if any
    async fn holder(&self, key: &str) -> CoordinationResult<Option<LockRecord>>;

    /// Short backend name for logging
    fn name(&self) -> &'static str;
}

pub(crate) fn lease_expiry(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}
