//! Metadata store trait definition

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{StorageRecord, SyncStatus};
use crate::AlertEvent;

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Durable metadata shared by the API, Task and Alert roles
///
/// Every write is an upsert or a conditional delete, so replaying a work
/// message against the store converges to the same state.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_storage(&self, id: &str) -> StorageResult<Option<StorageRecord>>;

    /// Insert or replace a storage record (keyed by id)
    async fn upsert_storage(&self, record: StorageRecord) -> StorageResult<()>;

    /// Flip the sync status of an existing record
    ///
    /// Returns `false` when no record with that id exists.
    async fn set_sync_status(&self, id: &str, status: SyncStatus) -> StorageResult<bool>;

    /// Returns `false` when there was nothing to delete.
    async fn delete_storage(&self, id: &str) -> StorageResult<bool>;

    /// All records ordered by id
    async fn list_storages(&self) -> StorageResult<Vec<StorageRecord>>;

    /// Persist an alert; an event with the same id replaces the old row
    async fn insert_alert(&self, event: &AlertEvent) -> StorageResult<()>;

    /// Most recent alerts of a storage, newest first
    async fn list_alerts(&self, source: &str, limit: usize) -> StorageResult<Vec<AlertEvent>>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
