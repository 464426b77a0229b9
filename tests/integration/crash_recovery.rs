//! Crash and lease expiry tests
//!
//! These tests verify that:
//! - A lock held by a dead instance frees itself after the lease, never before
//! - The work of the dead instance is redelivered and completed elsewhere
//! - A holder whose lease expired learns it on its next renewal
//! - Concurrent claimants on a shared SQLite lock table never both win

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use delfin::actors::dispatch::SessionOutcome;
use delfin::coordination::sqlite::SqliteCoordinator;
use delfin::coordination::{Acquire, Coordinator, Renewal};
use delfin::storage::MetadataStore;
use delfin::transport::Transport;
use delfin::TASK_QUEUE;
use futures::future::join_all;
use tempfile::tempdir;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_dead_holder_lock_frees_after_lease() {
    let platform = Platform::new(5);

    // Instance A takes array-2 and dies without releasing.
    let held = platform
        .coordinator
        .acquire("storage/array-2", "task-a/session", LEASE)
        .await
        .unwrap();
    assert!(held.is_acquired());

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(
        platform
            .coordinator
            .acquire("storage/array-2", "task-b/session", LEASE)
            .await
            .unwrap(),
        Acquire::Busy {
            holder: Some("task-a/session".to_string())
        }
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_matches!(
        platform
            .coordinator
            .acquire("storage/array-2", "task-b/session", LEASE)
            .await
            .unwrap(),
        Acquire::Acquired(handle) if handle.owner == "task-b/session"
    );

    // The dead holder's handle is fenced off.
    let Acquire::Acquired(stale) = held else { unreachable!() };
    assert_eq!(
        platform.coordinator.renew(&stale, LEASE).await.unwrap(),
        Renewal::Lost
    );
}

#[tokio::test(start_paused = true)]
async fn test_work_of_crashed_instance_completes_elsewhere() {
    let platform = Platform::new(5);
    let slow = DriverScript::slow(Duration::from_secs(60));
    let fast = DriverScript::default();
    let instance_a = Arc::new(platform.task_instance("task-a", slow.drivers()));
    let instance_b = platform.task_instance("task-b", fast.drivers());

    let message = discover_message("array-2", "scripted", "storage");
    platform.enqueue(&message).await;

    let delivery = platform.next(TASK_QUEUE, Duration::ZERO).await;
    let crashed = {
        let instance_a = instance_a.clone();
        tokio::spawn(async move { instance_a.process(delivery).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    crashed.abort();
    assert!(crashed.await.unwrap_err().is_cancelled());

    // Still held until the lease written at acquire time runs out.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(
        platform
            .coordinator
            .holder("storage/array-2")
            .await
            .unwrap()
            .is_some()
    );

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(
        platform
            .coordinator
            .holder("storage/array-2")
            .await
            .unwrap()
            .is_none()
    );

    // The unacked message comes back once its visibility timeout passes.
    let delivery = platform.next(TASK_QUEUE, VISIBILITY).await;
    assert_eq!(delivery.id(), message.id);
    assert_eq!(delivery.deliveries, 2);
    assert_eq!(
        instance_b.process(delivery).await,
        SessionOutcome::Committed { events: 0 }
    );

    assert_eq!(slow.calls(), 1);
    assert_eq!(fast.calls(), 1);
    assert!(platform.store.get_storage("array-2").await.unwrap().is_some());
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sqlite_lock_expires_and_fences_old_holder() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordination.db");
    let instance_a = SqliteCoordinator::new(&path).await.unwrap();
    let instance_b = SqliteCoordinator::new(&path).await.unwrap();
    let lease = Duration::from_millis(1500);

    let Acquire::Acquired(held) = instance_a.acquire("storage/array-2", "a/1", lease).await.unwrap()
    else {
        panic!("expected lock");
    };
    assert!(!instance_b.acquire("storage/array-2", "b/1", lease).await.unwrap().is_acquired());

    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert!(instance_b.acquire("storage/array-2", "b/1", lease).await.unwrap().is_acquired());
    assert_eq!(instance_a.renew(&held, lease).await.unwrap(), Renewal::Lost);

    // A late release from the old holder leaves the new one in place.
    instance_a.release(&held).await.unwrap();
    let holder = instance_b.holder("storage/array-2").await.unwrap().unwrap();
    assert_eq!(holder.owner, "b/1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimants_on_shared_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordination.db");

    let mut coordinators: Vec<Arc<dyn Coordinator>> = vec![];
    for _ in 0..4 {
        coordinators.push(Arc::new(SqliteCoordinator::new(&path).await.unwrap()));
    }

    let claims = (0..16).map(|n| {
        let coordinator = coordinators[n % coordinators.len()].clone();
        tokio::spawn(async move {
            coordinator
                .acquire("storage/array-1", &format!("claimant-{n}"), LEASE)
                .await
                .unwrap()
        })
    });

    let outcomes: Vec<Acquire> = join_all(claims)
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .collect();

    let winners: Vec<_> = outcomes.iter().filter(|o| o.is_acquired()).collect();
    assert_eq!(winners.len(), 1);

    let Acquire::Acquired(winner) = winners[0] else { unreachable!() };
    let holder = coordinators[0].holder("storage/array-1").await.unwrap().unwrap();
    assert_eq!(holder.owner, winner.owner);
}
