//! Request and response bodies of the API role

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Operation;
use crate::storage::{StorageRecord, StorageStatus, SyncStatus};
use crate::transport::DeadLetter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    /// `"ok"` or `"unhealthy"`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub store: String,
    pub transport: String,
    pub timestamp: String,
}

/// Body of `POST /v1/storages`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterStorageRequest {
    pub storage_id: String,
    pub vendor: String,
    pub model: String,

    /// Display name, defaults to the storage id
    #[serde(default)]
    pub name: Option<String>,
}

/// Reply to every request that only enqueues work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptedResponse {
    pub storage_id: String,
    pub messages: Vec<QueuedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedMessage {
    pub message_id: Uuid,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageView {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub status: StorageStatus,
    pub sync_status: SyncStatus,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub pool_count: u32,
    pub volume_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<StorageRecord> for StorageView {
    fn from(record: StorageRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            vendor: record.vendor,
            model: record.model,
            serial_number: record.serial_number,
            status: record.status,
            sync_status: record.sync_status,
            total_capacity: record.total_capacity,
            used_capacity: record.used_capacity,
            pool_count: record.pool_count,
            volume_count: record.volume_count,
            last_synced_at: record.last_synced_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoragesResponse {
    pub storages: Vec<StorageView>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetter>,
    pub count: usize,
}
