//! Retry exhaustion tests
//!
//! These tests verify that:
//! - A message failing on every delivery is dead-lettered after exactly
//!   `max_retries` attempts
//! - A message that succeeds on its last allowed attempt commits normally
//! - Dead letters are visible through the API, filtered by queue

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use delfin::actors::dispatch::SessionOutcome;
use delfin::api::{self, ApiConfig, ApiState};
use delfin::coordination::Coordinator;
use delfin::drivers::DriverManager;
use delfin::retry::{BackendHealth, RetryPolicy};
use delfin::storage::MetadataStore;
use delfin::transport::{Destination, Envelope, PublishOptions, Transport};
use delfin::{ALERT_QUEUE, TASK_QUEUE};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::helpers::*;

const MAX_RETRIES: u32 = 3;

async fn get_dead_letters(platform: &Platform, query: &str) -> Value {
    let state = ApiState::new(
        platform.store.clone(),
        platform.transport.clone(),
        Arc::new(DriverManager::new()),
        BackendHealth::new(),
        RetryPolicy::default(),
    );
    let app = api::router(&ApiConfig::default(), state);

    let response = app
        .oneshot(
            Request::get(format!("/v1/dead-letters{query}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_dead_lettered_after_exactly_max_retries() {
    let platform = Platform::new(MAX_RETRIES);
    let script = DriverScript::failing(u32::MAX);
    let instance = platform.task_instance("task-a", script.drivers());

    let message = discover_message("array-3", "scripted", "storage");
    platform.enqueue(&message).await;

    let mut outcomes = vec![];
    for _ in 0..MAX_RETRIES {
        let delivery = platform.next(TASK_QUEUE, Duration::from_secs(60)).await;
        outcomes.push(instance.process(delivery).await);
    }

    assert_matches!(
        outcomes[0],
        SessionOutcome::Failed { retry_in, .. } if retry_in == Duration::from_secs(1)
    );
    assert_matches!(
        outcomes[1],
        SessionOutcome::Failed { retry_in, .. } if retry_in == Duration::from_secs(2)
    );
    assert_matches!(outcomes[2], SessionOutcome::DeadLettered { .. });

    assert_eq!(script.calls(), MAX_RETRIES);
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
    assert!(platform.store.get_storage("array-3").await.unwrap().is_none());
    assert!(
        platform
            .coordinator
            .holder("storage/array-3")
            .await
            .unwrap()
            .is_none()
    );

    let listed = get_dead_letters(&platform, "?queue=delfin.task").await;
    assert_eq!(listed["count"], 1);
    let letter = &listed["dead_letters"][0];
    assert_eq!(letter["id"], json!(message.id));
    assert_eq!(letter["queue"], TASK_QUEUE);
    assert_eq!(letter["failures"], MAX_RETRIES);
    assert_eq!(letter["deliveries"], MAX_RETRIES);
    assert!(
        letter["reason"]
            .as_str()
            .unwrap()
            .contains("array did not answer")
    );
}

#[tokio::test(start_paused = true)]
async fn test_success_on_last_allowed_attempt_commits() {
    let platform = Platform::new(MAX_RETRIES);
    let script = DriverScript::failing(MAX_RETRIES - 1);
    let instance = platform.task_instance("task-a", script.drivers());

    platform
        .enqueue(&discover_message("array-3", "scripted", "storage"))
        .await;

    let mut last = None;
    for _ in 0..MAX_RETRIES {
        let delivery = platform.next(TASK_QUEUE, Duration::from_secs(60)).await;
        last = Some(instance.process(delivery).await);
    }

    assert_eq!(last, Some(SessionOutcome::Committed { events: 0 }));
    assert_eq!(script.calls(), MAX_RETRIES);
    assert!(platform.store.get_storage("array-3").await.unwrap().is_some());
    assert_eq!(get_dead_letters(&platform, "").await["count"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_poison_alert_is_dead_lettered_without_retries() {
    let platform = Platform::new(MAX_RETRIES);
    let instance = platform.alert_instance("alert-a");

    platform
        .transport
        .publish(
            &Destination::queue(ALERT_QUEUE),
            &Envelope::new(Uuid::new_v4(), json!({ "not": "a work message" })),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let delivery = platform.next(ALERT_QUEUE, Duration::ZERO).await;
    assert_matches!(
        instance.process(delivery).await,
        SessionOutcome::DeadLettered { .. }
    );

    assert_eq!(get_dead_letters(&platform, "?queue=delfin.alert").await["count"], 1);
    assert_eq!(get_dead_letters(&platform, "?queue=delfin.task").await["count"], 0);
    assert_eq!(get_dead_letters(&platform, "").await["count"], 1);
}
