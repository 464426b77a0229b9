//! In-memory metadata store (no persistence)
//!
//! Useful for tests and for running all roles inside one process. Everything
//! is lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, MetadataStore};
use super::error::StorageResult;
use super::schema::{StorageRecord, SyncStatus};
use crate::AlertEvent;

#[derive(Debug, Default)]
pub struct MemoryStore {
    storages: RwLock<BTreeMap<String, StorageRecord>>,
    alerts: RwLock<HashMap<uuid::Uuid, AlertEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_storage(&self, id: &str) -> StorageResult<Option<StorageRecord>> {
        Ok(self.storages.read().await.get(id).cloned())
    }

    async fn upsert_storage(&self, record: StorageRecord) -> StorageResult<()> {
        debug!("in-memory store: upsert storage {}", record.id);
        self.storages.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_sync_status(&self, id: &str, status: SyncStatus) -> StorageResult<bool> {
        let mut storages = self.storages.write().await;
        Ok(match storages.get_mut(id) {
            Some(record) => {
                record.sync_status = status;
                true
            }
            None => false,
        })
    }

    async fn delete_storage(&self, id: &str) -> StorageResult<bool> {
        Ok(self.storages.write().await.remove(id).is_some())
    }

    async fn list_storages(&self) -> StorageResult<Vec<StorageRecord>> {
        Ok(self.storages.read().await.values().cloned().collect())
    }

    async fn insert_alert(&self, event: &AlertEvent) -> StorageResult<()> {
        self.alerts.write().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn list_alerts(&self, source: &str, limit: usize) -> StorageResult<Vec<AlertEvent>> {
        let alerts = self.alerts.read().await;
        let mut matching: Vec<AlertEvent> = alerts
            .values()
            .filter(|event| event.source == source)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                (
                    "storages".to_string(),
                    self.storages.read().await.len().to_string(),
                ),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory store (no-op)");
        Ok(())
    }
}
