//! Coordination backend client
//!
//! Distributed mutual exclusion through lease-based locks. A lock is an
//! externally held record `key -> (owner, token, expiry)`; a crashed owner's
//! lock self-expires instead of blocking the resource forever.
//!
//! ## Contract
//!
//! - `acquire(key, owner, lease)` - non-blocking check-and-set, [`Acquire::Busy`]
//!   while another owner holds a live lease
//! - `renew(handle, lease)` - extends the lease, [`Renewal::Lost`] once the
//!   record no longer belongs to the handle
//! - `release(handle)` - idempotent delete
//!
//! ## Backends
//!
//! - **etcd** (`host:port` / `etcd://host:port`): etcd v3 JSON gateway, leases
//!   are etcd leases
//! - **SQLite** (`sqlite:///path`): lock table on the shared volume
//! - **Memory** (`memory://`): single process only, used by tests

pub mod backend;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

pub use backend::{Acquire, Coordinator, LockHandle, LockRecord, Renewal};
pub use error::{CoordinationError, CoordinationResult};

use crate::config::CoordinationEndpoint;

/// Build the coordinator named by `endpoint`
pub async fn connect(endpoint: &CoordinationEndpoint) -> CoordinationResult<Arc<dyn Coordinator>> {
    let coordinator: Arc<dyn Coordinator> = match endpoint {
        CoordinationEndpoint::Etcd { host, port } => {
            Arc::new(etcd::EtcdCoordinator::new(format!("http://{host}:{port}"))?)
        }
        CoordinationEndpoint::Sqlite { path } => Arc::new(sqlite::SqliteCoordinator::new(path).await?),
        CoordinationEndpoint::Memory => Arc::new(memory::MemoryCoordinator::new()),
    };

    Ok(coordinator)
}
