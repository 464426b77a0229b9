//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - Registration, sync, delete and alert requests enqueue the right work
//! - Requests naming unknown storages or drivers are rejected
//! - The registry view reflects sync status
//! - Authentication applies to everything but the health check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use delfin::api::{ApiConfig, ApiState, spawn_api_server};
use delfin::drivers::DriverManager;
use delfin::retry::{BackendHealth, RetryPolicy};
use delfin::transport::Transport;
use delfin::{ALERT_QUEUE, Operation, TASK_QUEUE, WorkMessage};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

const TOKEN: &str = "test-token";

struct TestApi {
    addr: SocketAddr,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestApi {
    // Random port, memory backends of `platform`
    async fn spawn(platform: &Platform, auth_token: Option<&str>) -> Self {
        let state = ApiState::new(
            platform.store.clone(),
            platform.transport.clone(),
            Arc::new(DriverManager::new()),
            BackendHealth::new(),
            RetryPolicy::default(),
        );
        let config = ApiConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: auth_token.map(str::to_string),
            enable_cors: true,
        };

        let shutdown = CancellationToken::new();
        let (addr, _) = spawn_api_server(config, state, shutdown.clone())
            .await
            .unwrap();

        Self {
            addr,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// Register array-1 through the Task role so the registry has a record
async fn seed_storage(platform: &Platform) {
    let task = platform.task_instance("task-a", DriverScript::default().drivers());
    platform
        .enqueue(&discover_message("array-1", "fake", "storage"))
        .await;
    task.process(platform.next(TASK_QUEUE, Duration::ZERO).await)
        .await;
}

async fn queued(platform: &Platform, queue: &str) -> WorkMessage {
    platform
        .next(queue, Duration::ZERO)
        .await
        .envelope
        .decode()
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint_returns_ok_without_token() {
    // Setup
    let platform = Platform::new(5);
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test
    let response = api.client.get(api.url("/v1/health")).send().await.unwrap();

    // Verify
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["transport"], "memory");
}

#[tokio::test]
async fn test_auth_required_for_registry() {
    // Setup
    let platform = Platform::new(5);
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test - no token
    let response = api
        .client
        .get(api.url("/v1/storages"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Test - wrong token
    let response = api
        .client
        .post(api.url("/v1/storages"))
        .bearer_auth("wrong-token")
        .json(&json!({ "storage_id": "array-1", "vendor": "fake", "model": "storage" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Nothing was enqueued by the rejected request
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_register_storage_enqueues_discover() {
    // Setup
    let platform = Platform::new(5);
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test
    let response = api
        .post(
            "/v1/storages",
            json!({ "storage_id": "array-1", "vendor": "fake", "model": "storage", "name": "lab" }),
        )
        .await;

    // Verify
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["storage_id"], "array-1");
    assert_eq!(body["messages"][0]["operation"], "discover");

    let message = queued(&platform, TASK_QUEUE).await;
    assert_eq!(body["messages"][0]["message_id"], json!(message.id));
    assert_eq!(message.operation, Operation::Discover);
    assert_eq!(message.target, "array-1");
    assert_eq!(
        message.payload,
        json!({ "name": "lab", "vendor": "fake", "model": "storage" })
    );
}

#[tokio::test]
async fn test_register_storage_rejects_bad_requests() {
    // Setup
    let platform = Platform::new(5);
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test - no driver for the vendor
    let response = api
        .post(
            "/v1/storages",
            json!({ "storage_id": "array-1", "vendor": "acme", "model": "x9" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("acme"));

    // Test - empty id
    let response = api
        .post(
            "/v1/storages",
            json!({ "storage_id": " ", "vendor": "fake", "model": "storage" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_storage_returns_404() {
    // Setup
    let platform = Platform::new(5);
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test
    let sync = api.post("/v1/storages/missing/sync", Value::Null).await;
    let delete = api.delete("/v1/storages/missing").await;
    let alert = api
        .post("/v1/storages/missing/alerts", json!({ "severity": "major" }))
        .await;

    // Verify
    assert_eq!(sync.status(), StatusCode::NOT_FOUND);
    assert_eq!(delete.status(), StatusCode::NOT_FOUND);
    assert_eq!(alert.status(), StatusCode::NOT_FOUND);
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);
    assert_eq!(platform.transport.pending(ALERT_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sync_marks_storage_syncing() {
    // Setup
    let platform = Platform::new(5);
    seed_storage(&platform).await;
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    let body: Value = api.get("/v1/storages").await.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["storages"][0]["sync_status"], "SYNCED");

    // Test
    let response = api.post("/v1/storages/array-1/sync", Value::Null).await;

    // Verify
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let message = queued(&platform, TASK_QUEUE).await;
    assert_eq!(message.operation, Operation::SyncResources);
    assert_eq!(message.target, "array-1");

    let body: Value = api.get("/v1/storages").await.json().await.unwrap();
    assert_eq!(body["storages"][0]["id"], "array-1");
    assert_eq!(body["storages"][0]["sync_status"], "SYNCING");
}

#[tokio::test]
async fn test_delete_enqueues_removal_then_eviction() {
    // Setup
    let platform = Platform::new(5);
    seed_storage(&platform).await;
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;

    // Test
    let response = api.delete("/v1/storages/array-1").await;

    // Verify
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["messages"].as_array().unwrap().len(), 2);

    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 2);
    let first = queued(&platform, TASK_QUEUE).await;
    let second = queued(&platform, TASK_QUEUE).await;
    assert_eq!(
        (first.operation, second.operation),
        (Operation::RemoveResources, Operation::RemoveFromCache)
    );
}

#[tokio::test]
async fn test_alert_goes_to_alert_queue() {
    // Setup
    let platform = Platform::new(5);
    seed_storage(&platform).await;
    let api = TestApi::spawn(&platform, Some(TOKEN)).await;
    let raw = json!({ "severity": "major", "description": "pool-1 degraded" });

    // Test
    let response = api.post("/v1/storages/array-1/alerts", raw.clone()).await;

    // Verify
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let message = queued(&platform, ALERT_QUEUE).await;
    assert_eq!(message.operation, Operation::ProcessAlert);
    assert_eq!(message.payload, raw);
    assert_eq!(platform.transport.pending(TASK_QUEUE).await.unwrap(), 0);

    // Test - the body must be an object
    let response = api
        .post("/v1/storages/array-1/alerts", json!(["not", "an", "alert"]))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
