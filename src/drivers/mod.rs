//! Storage drivers
//!
//! A driver talks to one storage array. Drivers are looked up by
//! `"{vendor}_{model}"` and instantiated once per storage id; the instance is
//! cached until the storage is removed (`remove_from_cache`).
//!
//! Only the built-in deterministic [`fake::FakeStorageDriver`]
//! (`fake_storage`) ships with the crate. Real array protocols are out of
//! scope; further drivers plug in through [`DriverManager::register`].

pub mod fake;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::Severity;
use crate::error::OperationError;
use crate::storage::StorageStatus;

/// What a driver needs to reach a storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccess {
    pub storage_id: String,
    pub name: String,
    pub vendor: String,
    pub model: String,
}

impl StorageAccess {
    pub fn driver_key(&self) -> String {
        driver_key(&self.vendor, &self.model)
    }
}

pub fn driver_key(vendor: &str, model: &str) -> String {
    format!("{vendor}_{model}")
}

/// Storage level facts reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub status: StorageStatus,
    pub total_capacity: u64,
    pub used_capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: String,
    pub name: String,
    pub total_capacity: u64,
    pub used_capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: String,
    pub name: String,
    pub pool_id: String,
    pub capacity: u64,
}

/// Vendor alert translated into platform terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAlert {
    pub severity: Severity,
    pub message: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn get_storage(&self) -> Result<StorageInfo, OperationError>;

    async fn list_pools(&self) -> Result<Vec<PoolInfo>, OperationError>;

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, OperationError>;

    /// Translate a raw alert as received from the array
    fn parse_alert(&self, raw: &serde_json::Value) -> Result<ParsedAlert, OperationError>;
}

pub type DriverFactory = Arc<dyn Fn(&StorageAccess) -> Arc<dyn StorageDriver> + Send + Sync>;

/// Driver registry plus per-storage instance cache
///
/// The cache is process local and rebuilt on demand, so losing it on restart
/// costs one driver construction per storage.
pub struct DriverManager {
    factories: HashMap<String, DriverFactory>,
    instances: RwLock<HashMap<String, Arc<dyn StorageDriver>>>,
}

impl DriverManager {
    /// Registry with the built-in drivers
    pub fn new() -> Self {
        let mut manager = Self {
            factories: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
        };
        manager.register(
            fake::DRIVER_KEY,
            Arc::new(|access: &StorageAccess| {
                Arc::new(fake::FakeStorageDriver::new(access)) as Arc<dyn StorageDriver>
            }),
        );
        manager
    }

    pub fn register(&mut self, key: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(key.into(), factory);
    }

    pub fn supports(&self, vendor: &str, model: &str) -> bool {
        self.factories.contains_key(&driver_key(vendor, model))
    }

    /// Cached driver of a storage, created on first use
    pub async fn driver(
        &self,
        access: &StorageAccess,
    ) -> Result<Arc<dyn StorageDriver>, OperationError> {
        if let Some(driver) = self.instances.read().await.get(&access.storage_id) {
            return Ok(driver.clone());
        }

        let key = access.driver_key();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| OperationError::permanent(format!("no driver for '{key}'")))?;

        let mut instances = self.instances.write().await;
        let driver = instances
            .entry(access.storage_id.clone())
            .or_insert_with(|| {
                debug!("creating {key} driver for storage {}", access.storage_id);
                factory(access)
            })
            .clone();
        Ok(driver)
    }

    /// Replace the cached driver of a storage with a fresh instance
    pub async fn reload(
        &self,
        access: &StorageAccess,
    ) -> Result<Arc<dyn StorageDriver>, OperationError> {
        self.remove_driver(&access.storage_id).await;
        self.driver(access).await
    }

    /// Drop the cached driver; returns whether one was cached
    pub async fn remove_driver(&self, storage_id: &str) -> bool {
        let removed = self.instances.write().await.remove(storage_id).is_some();
        if removed {
            info!("removed driver of storage {storage_id} from cache");
        }
        removed
    }

    pub async fn is_cached(&self, storage_id: &str) -> bool {
        self.instances.read().await.contains_key(storage_id)
    }
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}
