//! Persistent store accessor
//!
//! Durable metadata on the shared volume: the storage registry (one record per
//! monitored storage, with its sync status) and the alert history. The API,
//! Task and Alert roles mount the volume read-write; the Exporter never opens
//! it.
//!
//! ## Backends
//!
//! - **SQLite** (default): database file on the shared volume, WAL mode
//! - **Memory**: no persistence, for tests and single-process development
//!
//! The SQLite pool opener in [`sqlite::open_pool`] is shared with the SQLite
//! coordination and transport backends; all tables come from one migration
//! set so the three can live in the same file.

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

pub use backend::{HealthStatus, MetadataStore};
pub use error::{StorageError, StorageResult};
pub use schema::{StorageRecord, StorageStatus, SyncStatus};

use crate::config::StorageConfig;

/// Open the metadata store described by `config`
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match config {
        StorageConfig::None => Arc::new(memory::MemoryStore::new()),
        StorageConfig::Sqlite { path } => Arc::new(sqlite::SqliteStore::new(path).await?),
    };

    Ok(store)
}
