//! Task role handler: storage registration and resource sync
//!
//! | Operation           | execute                          | commit                       |
//! |---------------------|----------------------------------|------------------------------|
//! | `discover`          | fresh driver, read inventory     | upsert record (SYNCED)       |
//! | `sync_resources`    | cached driver, read inventory    | upsert record (SYNCED)       |
//! | `remove_resources`  | -                                | delete record                |
//! | `remove_from_cache` | -                                | evict cached driver          |
//!
//! Discovery and sync short-circuit to a no-op commit when the stored record
//! was already synced at or after the message's `requested_at`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{WorkHandler, derived_event_id};
use crate::drivers::{DriverManager, StorageAccess, StorageInfo};
use crate::error::OperationError;
use crate::storage::{MetadataStore, StorageRecord, StorageStatus, SyncStatus};
use crate::{AlertEvent, Operation, Severity, WorkMessage};

/// Payload of a `discover` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub name: String,
    pub vendor: String,
    pub model: String,
}

/// Inventory gathered by `execute`
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub access: StorageAccess,
    pub info: StorageInfo,
    pub pool_count: u32,
    pub volume_count: u32,

    /// Record as it was when the session started
    pub previous: Option<StorageRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Stored state already reflects this request
    Current,
    Synced(Box<SyncResult>),
    Remove,
    Evict,
}

pub struct StorageSyncHandler {
    store: Arc<dyn MetadataStore>,
    drivers: Arc<DriverManager>,
}

impl StorageSyncHandler {
    pub fn new(store: Arc<dyn MetadataStore>, drivers: Arc<DriverManager>) -> Self {
        Self { store, drivers }
    }

    async fn gather(
        &self,
        access: StorageAccess,
        previous: Option<StorageRecord>,
        fresh_driver: bool,
    ) -> Result<TaskOutcome, OperationError> {
        let driver = if fresh_driver {
            self.drivers.reload(&access).await?
        } else {
            self.drivers.driver(&access).await?
        };

        let info = driver.get_storage().await?;
        let pools = driver.list_pools().await?;
        let volumes = driver.list_volumes().await?;

        Ok(TaskOutcome::Synced(Box::new(SyncResult {
            access,
            info,
            pool_count: pools.len() as u32,
            volume_count: volumes.len() as u32,
            previous,
        })))
    }

    fn status_event(message: &WorkMessage, result: &SyncResult) -> Option<AlertEvent> {
        let was = result.previous.as_ref().map(|r| r.status);
        let now = result.info.status;
        if now == StorageStatus::Normal || was == Some(now) {
            return None;
        }

        let severity = match now {
            StorageStatus::Offline => Severity::Critical,
            _ => Severity::Major,
        };

        Some(AlertEvent {
            id: derived_event_id(message, "status"),
            severity,
            source: message.target.clone(),
            timestamp: message.requested_at,
            message: format!("storage status changed to {now}"),
            storage_name: Some(result.info.name.clone()),
            vendor: Some(result.info.vendor.clone()),
            model: Some(result.info.model.clone()),
        })
    }
}

#[async_trait]
impl WorkHandler for StorageSyncHandler {
    type Output = TaskOutcome;

    fn name(&self) -> &'static str {
        "storage_sync"
    }

    #[instrument(skip_all, fields(target = %message.target, operation = %message.operation))]
    async fn execute(&self, message: &WorkMessage) -> Result<TaskOutcome, OperationError> {
        match message.operation {
            Operation::Discover => {
                let request: DiscoverRequest = serde_json::from_value(message.payload.clone())
                    .map_err(|e| OperationError::permanent(format!("invalid discover payload: {e}")))?;

                let previous = self.store.get_storage(&message.target).await?;
                if previous
                    .as_ref()
                    .is_some_and(|record| record.is_current(message.requested_at))
                {
                    debug!("discovery result already current");
                    return Ok(TaskOutcome::Current);
                }

                if !self.drivers.supports(&request.vendor, &request.model) {
                    return Err(OperationError::permanent(format!(
                        "no driver for {}_{}",
                        request.vendor, request.model
                    )));
                }

                let access = StorageAccess {
                    storage_id: message.target.clone(),
                    name: request.name,
                    vendor: request.vendor,
                    model: request.model,
                };
                self.gather(access, previous, true).await
            }
            Operation::SyncResources => {
                let Some(record) = self.store.get_storage(&message.target).await? else {
                    // Removed in the meantime; nothing left to sync.
                    warn!("sync requested for unknown storage");
                    return Ok(TaskOutcome::Current);
                };

                if record.is_current(message.requested_at) {
                    debug!("resources already synced");
                    return Ok(TaskOutcome::Current);
                }

                let access = StorageAccess {
                    storage_id: record.id.clone(),
                    name: record.name.clone(),
                    vendor: record.vendor.clone(),
                    model: record.model.clone(),
                };
                self.gather(access, Some(record), false).await
            }
            Operation::RemoveResources => Ok(TaskOutcome::Remove),
            Operation::RemoveFromCache => Ok(TaskOutcome::Evict),
            Operation::ProcessAlert => Err(OperationError::permanent(
                "process_alert is handled by the alert role",
            )),
        }
    }

    #[instrument(skip_all, fields(target = %message.target, operation = %message.operation))]
    async fn commit(
        &self,
        message: &WorkMessage,
        output: TaskOutcome,
    ) -> Result<Vec<AlertEvent>, OperationError> {
        match output {
            TaskOutcome::Current => Ok(vec![]),
            TaskOutcome::Synced(result) => {
                let now = Utc::now();
                let created_at = result
                    .previous
                    .as_ref()
                    .map_or(message.requested_at, |r| r.created_at);

                self.store
                    .upsert_storage(StorageRecord {
                        id: result.access.storage_id.clone(),
                        name: result.info.name.clone(),
                        vendor: result.info.vendor.clone(),
                        model: result.info.model.clone(),
                        serial_number: result.info.serial_number.clone(),
                        status: result.info.status,
                        sync_status: SyncStatus::Synced,
                        total_capacity: result.info.total_capacity,
                        used_capacity: result.info.used_capacity,
                        pool_count: result.pool_count,
                        volume_count: result.volume_count,
                        created_at,
                        last_synced_at: Some(now),
                    })
                    .await?;

                info!(
                    "synced storage: {} pools, {} volumes",
                    result.pool_count, result.volume_count
                );
                Ok(Self::status_event(message, &result).into_iter().collect())
            }
            TaskOutcome::Remove => {
                if !self.store.delete_storage(&message.target).await? {
                    debug!("storage already removed");
                }
                Ok(vec![])
            }
            TaskOutcome::Evict => {
                self.drivers.remove_driver(&message.target).await;
                Ok(vec![])
            }
        }
    }
}
