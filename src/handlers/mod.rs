//! Role specific work handlers
//!
//! A handler is split in two phases so the dispatch core can guarantee that
//! a session that lost its lease never writes anything:
//!
//! 1. `execute` gathers everything the session will write (driver calls,
//!    store reads). It may be cancelled at any await point.
//! 2. `commit` applies the result. It only runs after the dispatch core
//!    confirmed the lease is still held, and every write in it is an upsert
//!    or a conditional delete so a duplicate commit converges.

pub mod alert;
pub mod storage_sync;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OperationError;
use crate::{AlertEvent, WorkMessage};

pub use alert::AlertHandler;
pub use storage_sync::StorageSyncHandler;

#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Handler name for logs
    fn name(&self) -> &'static str;

    async fn execute(&self, message: &WorkMessage) -> Result<Self::Output, OperationError>;

    /// Apply `output`; returns the events to publish
    async fn commit(
        &self,
        message: &WorkMessage,
        output: Self::Output,
    ) -> Result<Vec<AlertEvent>, OperationError>;
}

/// Stable id of the `kind` event a message produces
///
/// A redelivered message yields the same id, so republishing deduplicates.
pub fn derived_event_id(message: &WorkMessage, kind: &str) -> Uuid {
    Uuid::new_v5(&message.id, kind.as_bytes())
}
