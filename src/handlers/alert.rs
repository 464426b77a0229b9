//! Alert role handler
//!
//! Fills a raw alert with the storage's identity, lets the storage's driver
//! translate it and persists the resulting [`AlertEvent`]. The event id is
//! the work message id, so a redelivered alert overwrites its own row and
//! republishes under the same id.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::WorkHandler;
use crate::drivers::{DriverManager, StorageAccess};
use crate::error::OperationError;
use crate::storage::MetadataStore;
use crate::{AlertEvent, Operation, WorkMessage};

pub struct AlertHandler {
    store: Arc<dyn MetadataStore>,
    drivers: Arc<DriverManager>,
}

impl AlertHandler {
    pub fn new(store: Arc<dyn MetadataStore>, drivers: Arc<DriverManager>) -> Self {
        Self { store, drivers }
    }
}

#[async_trait]
impl WorkHandler for AlertHandler {
    type Output = AlertEvent;

    fn name(&self) -> &'static str {
        "alert"
    }

    #[instrument(skip_all, fields(target = %message.target))]
    async fn execute(&self, message: &WorkMessage) -> Result<AlertEvent, OperationError> {
        if message.operation != Operation::ProcessAlert {
            return Err(OperationError::permanent(format!(
                "{} is not handled by the alert role",
                message.operation
            )));
        }

        // May still be registering; retry rather than drop.
        let storage = self
            .store
            .get_storage(&message.target)
            .await?
            .ok_or_else(|| {
                OperationError::recoverable(format!("storage {} is not registered", message.target))
            })?;

        let access = StorageAccess {
            storage_id: storage.id.clone(),
            name: storage.name.clone(),
            vendor: storage.vendor.clone(),
            model: storage.model.clone(),
        };
        let driver = self.drivers.driver(&access).await?;
        let parsed = driver.parse_alert(&message.payload)?;

        Ok(AlertEvent {
            id: message.id,
            severity: parsed.severity,
            source: message.target.clone(),
            timestamp: parsed.occurred_at.unwrap_or(message.requested_at),
            message: parsed.message,
            storage_name: Some(storage.name),
            vendor: Some(storage.vendor),
            model: Some(storage.model),
        })
    }

    async fn commit(
        &self,
        _message: &WorkMessage,
        event: AlertEvent,
    ) -> Result<Vec<AlertEvent>, OperationError> {
        self.store.insert_alert(&event).await?;
        info!("alert {} ({}) from {}", event.id, event.severity, event.source);
        Ok(vec![event])
    }
}
