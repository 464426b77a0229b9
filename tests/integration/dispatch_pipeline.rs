//! End-to-end tests of the dispatch pipeline
//!
//! These tests verify that:
//! - A discovery runs once even when requested twice concurrently
//! - The duplicate observes the lock as busy and later commits as a no-op
//! - Alert events flow from the Alert role to the exporter queue

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use delfin::actors::dispatch::SessionOutcome;
use delfin::coordination::Coordinator;
use delfin::storage::{MetadataStore, SyncStatus};
use delfin::transport::Transport;
use delfin::{AlertEvent, EVENTS_TOPIC, EXPORTER_QUEUE, Operation, Severity, TASK_QUEUE, WorkMessage};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_duplicate_discovery_is_busy_then_noop() {
    let platform = Platform::new(5);
    let script = DriverScript::slow(Duration::from_secs(5));
    let instance_a = Arc::new(platform.task_instance("task-a", script.drivers()));
    let instance_b = platform.task_instance("task-b", script.drivers());

    let first = discover_message("array-1", "scripted", "storage");
    let duplicate = discover_message("array-1", "scripted", "storage");
    platform.enqueue(&first).await;
    platform.enqueue(&duplicate).await;

    // A picks up the first request and holds storage/array-1 while discovering.
    let delivery = platform.next(TASK_QUEUE, Duration::ZERO).await;
    assert_eq!(delivery.id(), first.id);
    let session_a = {
        let instance_a = instance_a.clone();
        tokio::spawn(async move { instance_a.process(delivery).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // B gets the duplicate and finds the target busy.
    let delivery = platform.next(TASK_QUEUE, Duration::ZERO).await;
    assert_eq!(delivery.id(), duplicate.id);
    assert_matches!(
        instance_b.process(delivery).await,
        SessionOutcome::Contended { .. }
    );

    assert_eq!(
        session_a.await.unwrap(),
        SessionOutcome::Committed { events: 0 }
    );
    let record = platform.store.get_storage("array-1").await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.pool_count, 4);

    // Redelivered duplicate: already current, nothing re-read from the array.
    let delivery = platform.next(TASK_QUEUE, Duration::from_secs(5)).await;
    assert_eq!((delivery.id(), delivery.contended, delivery.failures), (duplicate.id, 1, 0));
    assert_eq!(
        instance_b.process(delivery).await,
        SessionOutcome::Committed { events: 0 }
    );

    assert_eq!(script.calls(), 1);
    assert_eq!(
        platform.store.get_storage("array-1").await.unwrap().unwrap(),
        record
    );
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
    assert!(platform.coordinator.holder("storage/array-1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_message_after_commit_is_noop() {
    let platform = Platform::new(5);
    let script = DriverScript::default();
    let instance = platform.task_instance("task-a", script.drivers());

    let message = discover_message("array-1", "scripted", "storage");
    platform.enqueue(&message).await;
    let delivery = platform.next(TASK_QUEUE, Duration::ZERO).await;
    assert_eq!(
        instance.process(delivery).await,
        SessionOutcome::Committed { events: 0 }
    );

    // The ack got lost: the same message shows up again.
    platform.enqueue(&message).await;
    let delivery = platform.next(TASK_QUEUE, Duration::ZERO).await;
    assert_eq!(
        instance.process(delivery).await,
        SessionOutcome::Committed { events: 0 }
    );
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_alert_reaches_exporter_queue_once() {
    let platform = Platform::new(5);
    platform
        .transport
        .bind(EVENTS_TOPIC, EXPORTER_QUEUE)
        .await
        .unwrap();

    let task = platform.task_instance("task-a", DriverScript::default().drivers());
    platform
        .enqueue(&discover_message("array-1", "fake", "storage"))
        .await;
    task.process(platform.next(TASK_QUEUE, Duration::ZERO).await)
        .await;

    let alert = WorkMessage::new(
        "array-1",
        Operation::ProcessAlert,
        json!({ "severity": "critical", "description": "controller A offline" }),
    );
    platform.enqueue(&alert).await;

    let alerts = platform.alert_instance("alert-a");
    let delivery = platform.next(Operation::ProcessAlert.queue(), Duration::ZERO).await;
    assert_eq!(
        alerts.process(delivery).await,
        SessionOutcome::Committed { events: 1 }
    );

    // A duplicate of the same alert republishes under the same event id.
    platform.enqueue(&alert).await;
    let delivery = platform.next(Operation::ProcessAlert.queue(), Duration::ZERO).await;
    alerts.process(delivery).await;

    assert_eq!(platform.transport.pending(EXPORTER_QUEUE).await.unwrap(), 1);
    let exported = platform.next(EXPORTER_QUEUE, Duration::ZERO).await;
    let event: AlertEvent = exported.envelope.decode().unwrap();
    assert_eq!(event.id, alert.id);
    assert_eq!(event.severity, Severity::Critical);
    assert_eq!(event.storage_name.as_deref(), Some("array-1 array"));

    assert_eq!(platform.store.list_alerts("array-1", 10).await.unwrap().len(), 1);
}
