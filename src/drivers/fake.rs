//! Deterministic in-process driver
//!
//! Reports the same storage, pools and volumes for the same storage id every
//! time, which makes sync results reproducible in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ParsedAlert, PoolInfo, StorageAccess, StorageDriver, StorageInfo, VolumeInfo};
use crate::Severity;
use crate::error::OperationError;
use crate::storage::StorageStatus;

pub const DRIVER_KEY: &str = "fake_storage";

const POOL_COUNT: u64 = 4;
const VOLUMES_PER_POOL: u64 = 2;
const GIB: u64 = 1024 * 1024 * 1024;

pub struct FakeStorageDriver {
    access: StorageAccess,
    seed: u64,
}

/// FNV-1a, stable across runs and platforms
fn seed(id: &str) -> u64 {
    id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl FakeStorageDriver {
    pub fn new(access: &StorageAccess) -> Self {
        Self {
            access: access.clone(),
            seed: seed(&access.storage_id),
        }
    }

    fn pool_capacity(&self) -> u64 {
        (512 + self.seed % 512) * GIB
    }

    fn pool_used(&self, index: u64) -> u64 {
        self.pool_capacity() / 8 * ((self.seed >> (index * 3)) % 8)
    }
}

#[async_trait]
impl StorageDriver for FakeStorageDriver {
    async fn get_storage(&self) -> Result<StorageInfo, OperationError> {
        Ok(StorageInfo {
            name: self.access.name.clone(),
            vendor: self.access.vendor.clone(),
            model: self.access.model.clone(),
            serial_number: Some(format!("FAKE-{:08X}", self.seed & 0xffff_ffff)),
            status: StorageStatus::Normal,
            total_capacity: self.pool_capacity() * POOL_COUNT,
            used_capacity: (0..POOL_COUNT).map(|i| self.pool_used(i)).sum(),
        })
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>, OperationError> {
        Ok((0..POOL_COUNT)
            .map(|i| PoolInfo {
                id: format!("{}-pool-{i}", self.access.storage_id),
                name: format!("pool_{i}"),
                total_capacity: self.pool_capacity(),
                used_capacity: self.pool_used(i),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, OperationError> {
        let mut volumes = vec![];
        for pool in 0..POOL_COUNT {
            for n in 0..VOLUMES_PER_POOL {
                volumes.push(VolumeInfo {
                    id: format!("{}-vol-{pool}-{n}", self.access.storage_id),
                    name: format!("volume_{pool}_{n}"),
                    pool_id: format!("{}-pool-{pool}", self.access.storage_id),
                    capacity: self.pool_used(pool) / VOLUMES_PER_POOL,
                });
            }
        }
        Ok(volumes)
    }

    /// Expects `{"severity": "...", "description": "...", "occurred_at": "<rfc3339>"}`;
    /// `message` is accepted in place of `description`.
    fn parse_alert(&self, raw: &serde_json::Value) -> Result<ParsedAlert, OperationError> {
        let message = raw
            .get("description")
            .or_else(|| raw.get("message"))
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| OperationError::permanent("alert has no description"))?;

        let severity = match raw.get("severity").and_then(|v| v.as_str()) {
            Some(s) => s.parse::<Severity>().map_err(OperationError::permanent)?,
            None => Severity::Warning,
        };

        let occurred_at = raw
            .get("occurred_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ParsedAlert {
            severity,
            message: message.to_string(),
            occurred_at,
        })
    }
}
