//! Metadata rows
//!
//! One [`StorageRecord`] per registered storage. Aggregates reported by the
//! driver (capacity, pool and volume counts) are plain columns; the record is
//! small enough that no JSON side column is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a storage as reported by its driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    Normal,
    Offline,
    Abnormal,
}

impl StorageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStatus::Normal => "normal",
            StorageStatus::Offline => "offline",
            StorageStatus::Abnormal => "abnormal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(StorageStatus::Normal),
            "offline" => Some(StorageStatus::Offline),
            "abnormal" => Some(StorageStatus::Abnormal),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a storage's metadata is being refreshed
///
/// Stored as an integer (`0` synced, `1` syncing), rendered as
/// `"SYNCED"` / `"SYNCING"` by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Synced,
    Syncing,
}

impl SyncStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            SyncStatus::Synced => 0,
            SyncStatus::Syncing => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Syncing
        }
    }
}

/// A registered storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Storage identifier (the resource id work messages target)
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub status: StorageStatus,
    pub sync_status: SyncStatus,

    /// Bytes
    pub total_capacity: u64,

    /// Bytes
    pub used_capacity: u64,
    pub pool_count: u32,
    pub volume_count: u32,
    pub created_at: DateTime<Utc>,

    /// Completion time of the last successful sync
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StorageRecord {
    /// Whether a sync requested at `requested_at` would repeat work that
    /// already completed.
    pub fn is_current(&self, requested_at: DateTime<Utc>) -> bool {
        self.sync_status == SyncStatus::Synced
            && self
                .last_synced_at
                .is_some_and(|synced| synced >= requested_at)
    }
}
