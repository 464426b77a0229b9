//! In-memory coordinator
//!
//! Holds the lock table inside the process. Every clone of the surrounding
//! `Arc` sees the same table, which is enough to simulate several instances in
//! one test process. Expiry uses the tokio clock so paused-time tests can
//! fast-forward leases.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::backend::{Acquire, Coordinator, LockHandle, LockRecord, Renewal, lease_expiry};
use super::error::CoordinationResult;

#[derive(Debug, Clone)]
struct MemoryLock {
    owner: String,
    token: String,
    deadline: Instant,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl MemoryLock {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// Lock table shared by everything holding the same instance
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    locks: Mutex<HashMap<String, MemoryLock>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the record of `key` whoever holds it
    ///
    /// Same effect as the lease running out while its holder is partitioned.
    pub async fn evict(&self, key: &str) -> bool {
        self.locks.lock().await.remove(key).is_some()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> CoordinationResult<Acquire> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;

        let token = match locks.get(key) {
            Some(existing) if existing.is_live(now) && existing.owner != owner => {
                trace!("{key} busy, held by {}", existing.owner);
                return Ok(Acquire::Busy {
                    holder: Some(existing.owner.clone()),
                });
            }
            Some(existing) if existing.is_live(now) => existing.token.clone(),
            _ => Uuid::new_v4().to_string(),
        };

        let lock = MemoryLock {
            owner: owner.to_string(),
            token: token.clone(),
            deadline: now + lease,
            expires_at: lease_expiry(lease),
        };
        let expires_at = lock.expires_at;
        locks.insert(key.to_string(), lock);

        Ok(Acquire::Acquired(LockHandle {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            expires_at,
        }))
    }

    async fn renew(&self, handle: &LockHandle, lease: Duration) -> CoordinationResult<Renewal> {
        let mut locks = self.locks.lock().await;

        match locks.get_mut(&handle.key) {
            Some(lock) if lock.owner == handle.owner && lock.token == handle.token => {
                lock.deadline = Instant::now() + lease;
                lock.expires_at = lease_expiry(lease);
                Ok(Renewal::Renewed {
                    expires_at: lock.expires_at,
                })
            }
            _ => Ok(Renewal::Lost),
        }
    }

    async fn release(&self, handle: &LockHandle) -> CoordinationResult<()> {
        let mut locks = self.locks.lock().await;

        let owned = locks
            .get(&handle.key)
            .is_some_and(|lock| lock.owner == handle.owner && lock.token == handle.token);
        if owned {
            locks.remove(&handle.key);
        }

        Ok(())
    }

    async fn holder(&self, key: &str) -> CoordinationResult<Option<LockRecord>> {
        let now = Instant::now();
        let locks = self.locks.lock().await;

        Ok(locks
            .get(key)
            .filter(|lock| lock.is_live(now))
            .map(|lock| LockRecord {
                key: key.to_string(),
                owner: lock.owner.clone(),
                expires_at: lock.expires_at,
            }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_second_owner_is_busy() {
        let coordinator = MemoryCoordinator::new();

        let first = coordinator.acquire("storage/a", "one", LEASE).await.unwrap();
        assert!(first.is_acquired());

        let second = coordinator.acquire("storage/a", "two", LEASE).await.unwrap();
        assert_eq!(
            second,
            Acquire::Busy {
                holder: Some("one".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_same_owner_reacquire_keeps_token() {
        let coordinator = MemoryCoordinator::new();

        let Acquire::Acquired(first) = coordinator.acquire("k", "one", LEASE).await.unwrap() else {
            panic!("expected lock");
        };
        let Acquire::Acquired(again) = coordinator.acquire("k", "one", LEASE).await.unwrap() else {
            panic!("expected re-entrant lock");
        };

        assert_eq!(first.token, again.token);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let coordinator = MemoryCoordinator::new();

        let Acquire::Acquired(handle) = coordinator.acquire("k", "one", LEASE).await.unwrap()
        else {
            panic!("expected lock");
        };

        coordinator.release(&handle).await.unwrap();
        coordinator.release(&handle).await.unwrap();

        assert!(coordinator.holder("k").await.unwrap().is_none());
        assert!(coordinator.acquire("k", "two", LEASE).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_stale_release_does_not_drop_new_owner() {
        let coordinator = MemoryCoordinator::new();

        let Acquire::Acquired(stale) = coordinator.acquire("k", "one", LEASE).await.unwrap() else {
            panic!("expected lock");
        };
        coordinator.release(&stale).await.unwrap();
        assert!(coordinator.acquire("k", "two", LEASE).await.unwrap().is_acquired());

        coordinator.release(&stale).await.unwrap();

        let holder = coordinator.holder("k").await.unwrap().unwrap();
        assert_eq!(holder.owner, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_after_duration_and_not_before() {
        let coordinator = MemoryCoordinator::new();
        assert!(coordinator.acquire("k", "crashed", LEASE).await.unwrap().is_acquired());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_matches!(
            coordinator.acquire("k", "survivor", LEASE).await.unwrap(),
            Acquire::Busy { .. }
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(coordinator.acquire("k", "survivor", LEASE).await.unwrap().is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_reclaim_is_lost() {
        let coordinator = MemoryCoordinator::new();

        let Acquire::Acquired(handle) = coordinator.acquire("k", "one", LEASE).await.unwrap()
        else {
            panic!("expected lock");
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(coordinator.acquire("k", "two", LEASE).await.unwrap().is_acquired());

        assert_eq!(coordinator.renew(&handle, LEASE).await.unwrap(), Renewal::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let coordinator = MemoryCoordinator::new();

        let Acquire::Acquired(handle) = coordinator.acquire("k", "one", LEASE).await.unwrap()
        else {
            panic!("expected lock");
        };

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_matches!(
            coordinator.renew(&handle, LEASE).await.unwrap(),
            Renewal::Renewed { .. }
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_matches!(
            coordinator.acquire("k", "two", LEASE).await.unwrap(),
            Acquire::Busy { .. }
        );
    }

    #[tokio::test]
    async fn test_concurrent_claimants_single_winner() {
        let coordinator = Arc::new(MemoryCoordinator::new());

        let mut tasks = vec![];
        for i in 0..16 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .acquire("storage/hot", &format!("owner-{i}"), LEASE)
                    .await
                    .unwrap()
                    .is_acquired()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }
}
