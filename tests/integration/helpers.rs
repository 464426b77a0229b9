//! Helper functions for integration tests
//!
//! A [`Platform`] is one set of shared backends (coordination, transport,
//! metadata store); every "instance" built on it behaves like a separate role
//! process talking to the same deployment.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use delfin::actors::dispatch::{DispatchCore, DispatchPolicy};
use delfin::coordination::memory::MemoryCoordinator;
use delfin::drivers::fake::FakeStorageDriver;
use delfin::drivers::{
    DriverManager, ParsedAlert, PoolInfo, StorageAccess, StorageDriver, StorageInfo, VolumeInfo,
};
use delfin::error::OperationError;
use delfin::handlers::{AlertHandler, StorageSyncHandler};
use delfin::retry::{BackendHealth, BackoffPolicy, RetryPolicy};
use delfin::storage::memory::MemoryStore;
use delfin::transport::memory::MemoryTransport;
use delfin::transport::{Delivery, Destination, Envelope, PublishOptions, Transport};
use delfin::{Operation, WorkMessage};
use serde_json::json;
use tokio::sync::watch;

pub const LEASE: Duration = Duration::from_secs(30);
pub const VISIBILITY: Duration = Duration::from_secs(120);

pub fn create_test_policy(max_retries: u32) -> DispatchPolicy {
    DispatchPolicy {
        max_retries,
        lease: LEASE,
        busy_backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 2),
        failure_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 2),
    }
}

pub fn discover_message(storage_id: &str, vendor: &str, model: &str) -> WorkMessage {
    WorkMessage::new(
        storage_id,
        Operation::Discover,
        json!({ "name": format!("{storage_id} array"), "vendor": vendor, "model": model }),
    )
}

/// Wraps the fake driver with a delay and an optional number of failing calls
pub struct ScriptedDriver {
    inner: FakeStorageDriver,
    delay: Duration,
    failures_left: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl StorageDriver for ScriptedDriver {
    async fn get_storage(&self) -> Result<StorageInfo, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OperationError::recoverable("array did not answer"));
        }
        self.inner.get_storage().await
    }

    async fn list_pools(&self) -> Result<Vec<PoolInfo>, OperationError> {
        self.inner.list_pools().await
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, OperationError> {
        self.inner.list_volumes().await
    }

    fn parse_alert(&self, raw: &serde_json::Value) -> Result<ParsedAlert, OperationError> {
        self.inner.parse_alert(raw)
    }
}

/// Observes and scripts the `scripted_storage` driver of one instance
#[derive(Clone, Default)]
pub struct DriverScript {
    pub delay: Duration,
    pub failures_left: Arc<AtomicU32>,
    pub calls: Arc<AtomicU32>,
}

impl DriverScript {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing(failures: u32) -> Self {
        let script = Self::default();
        script.failures_left.store(failures, Ordering::SeqCst);
        script
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Driver manager with the built-ins plus `scripted_storage`
    pub fn drivers(&self) -> Arc<DriverManager> {
        let mut drivers = DriverManager::new();
        let script = self.clone();
        drivers.register(
            "scripted_storage",
            Arc::new(move |access: &StorageAccess| {
                Arc::new(ScriptedDriver {
                    inner: FakeStorageDriver::new(access),
                    delay: script.delay,
                    failures_left: script.failures_left.clone(),
                    calls: script.calls.clone(),
                }) as Arc<dyn StorageDriver>
            }),
        );
        Arc::new(drivers)
    }
}

/// Shared backends of one simulated deployment
pub struct Platform {
    pub coordinator: Arc<MemoryCoordinator>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<MemoryStore>,
    pub policy_tx: watch::Sender<DispatchPolicy>,
}

impl Platform {
    pub fn new(max_retries: u32) -> Self {
        let (policy_tx, _) = watch::channel(create_test_policy(max_retries));
        Self {
            coordinator: Arc::new(MemoryCoordinator::new()),
            transport: Arc::new(MemoryTransport::new(VISIBILITY)),
            store: Arc::new(MemoryStore::new()),
            policy_tx,
        }
    }

    /// Task role dispatch core of instance `instance`
    pub fn task_instance(
        &self,
        instance: &str,
        drivers: Arc<DriverManager>,
    ) -> DispatchCore<StorageSyncHandler> {
        DispatchCore::new(
            Arc::new(StorageSyncHandler::new(self.store.clone(), drivers)),
            self.coordinator.clone(),
            self.transport.clone(),
            self.policy_tx.subscribe(),
            instance,
            RetryPolicy::default(),
            VISIBILITY,
            BackendHealth::new(),
        )
    }

    /// Alert role dispatch core of instance `instance`
    pub fn alert_instance(&self, instance: &str) -> DispatchCore<AlertHandler> {
        DispatchCore::new(
            Arc::new(AlertHandler::new(
                self.store.clone(),
                Arc::new(DriverManager::new()),
            )),
            self.coordinator.clone(),
            self.transport.clone(),
            self.policy_tx.subscribe(),
            instance,
            RetryPolicy::default(),
            VISIBILITY,
            BackendHealth::new(),
        )
    }

    pub async fn enqueue(&self, message: &WorkMessage) {
        self.transport
            .publish(
                &Destination::queue(message.operation.queue()),
                &Envelope::encode(message.id, message).unwrap(),
                PublishOptions::default(),
            )
            .await
            .unwrap();
    }

    /// Next delivery of `queue`, waiting up to `wait`
    pub async fn next(&self, queue: &str, wait: Duration) -> Delivery {
        self.transport
            .receive(queue, wait)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no delivery on {queue} within {wait:?}"))
    }
}
