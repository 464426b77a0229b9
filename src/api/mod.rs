//! HTTP listener of the API role
//!
//! Translates requests into work messages for the Task and Alert roles and
//! exposes the storage registry and the dead-letter holding area.
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Transport** publisher for work messages
//! - **Metadata store** for the registry views
//!
//! ## Endpoints
//!
//! - `GET /v1/health` - Health check
//! - `GET /v1/storages` - Registered storages with sync status
//! - `POST /v1/storages` - Register a storage (enqueues `discover`)
//! - `POST /v1/storages/{id}/sync` - Enqueue `sync_resources`
//! - `DELETE /v1/storages/{id}` - Enqueue `remove_resources` and `remove_from_cache`
//! - `POST /v1/storages/{id}/alerts` - Enqueue `process_alert`
//! - `GET /v1/dead-letters?queue=` - Dead letters, newest first

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{
    AcceptedResponse, DeadLettersResponse, HealthResponse, QueuedMessage, RegisterStorageRequest,
    StorageView, StoragesResponse,
};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:8190")
    pub bind_addr: SocketAddr,

    /// Optional authentication token
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::util::get_default_api_port())),
            auth_token: None,
            enable_cors: true,
        }
    }
}

/// Build the router with all routes and layers
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/v1/health", get(routes::health::health_check))
        .route(
            "/v1/storages",
            get(routes::storages::list_storages).post(routes::storages::register_storage),
        )
        .route(
            "/v1/storages/:id",
            axum::routing::delete(routes::storages::delete_storage),
        )
        .route("/v1/storages/:id/sync", post(routes::storages::sync_storage))
        .route("/v1/storages/:id/alerts", post(routes::storages::post_alert))
        .route(
            "/v1/dead-letters",
            get(routes::dead_letters::list_dead_letters),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = &config.auth_token {
        let token: Arc<str> = Arc::from(token.as_str());
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Spawn the API server
///
/// Serves until `shutdown` is cancelled. Returns the bound address and the
/// server task.
pub async fn spawn_api_server(
    config: ApiConfig,
    state: ApiState,
    shutdown: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("API server error: {}", e);
        }
    });

    Ok((addr, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverManager;
    use crate::retry::{BackendHealth, RetryPolicy};
    use crate::storage::memory::MemoryStore;
    use crate::transport::memory::MemoryTransport;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use crate::storage::{MetadataStore, StorageRecord, StorageStatus, SyncStatus};
    use crate::transport::{
        DeadLetter, Delivery, Destination, Envelope, NackReason, PublishOptions, Transport,
        TransportError, TransportResult,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> ApiState {
        ApiState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTransport::new(Duration::from_secs(60))),
            Arc::new(DriverManager::new()),
            BackendHealth::new(),
            RetryPolicy::default(),
        )
    }

    fn config(token: Option<&str>) -> ApiConfig {
        ApiConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_token: token.map(str::to_string),
            enable_cors: false,
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = router(&config(Some("secret")), state());

        let response = app
            .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_required_elsewhere() {
        let app = router(&config(Some("secret")), state());

        let response = app
            .clone()
            .oneshot(Request::get("/v1/storages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/v1/storages")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(
                Request::get("/v1/storages")
                    .header("Authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unhealthy_process_reports_503() {
        let state = state();
        state.health.mark_unhealthy("transport: gone");
        let app = router(&config(None), state);

        let response = app
            .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    /// Transport whose queue publishes are all refused
    struct QueueOutage(MemoryTransport);

    #[async_trait]
    impl Transport for QueueOutage {
        async fn publish(
            &self,
            destination: &Destination,
            envelope: &Envelope,
            options: PublishOptions,
        ) -> TransportResult<()> {
            if matches!(destination, Destination::Queue(_)) {
                return Err(TransportError::InvalidRequest("queue rejected publish".to_string()));
            }
            self.0.publish(destination, envelope, options).await
        }

        async fn bind(&self, topic: &str, queue: &str) -> TransportResult<()> {
            self.0.bind(topic, queue).await
        }

        async fn receive(&self, queue: &str, wait: Duration) -> TransportResult<Option<Delivery>> {
            self.0.receive(queue, wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
            self.0.ack(delivery).await
        }

        async fn nack(
            &self,
            delivery: &Delivery,
            delay: Duration,
            reason: NackReason,
        ) -> TransportResult<()> {
            self.0.nack(delivery, delay, reason).await
        }

        async fn extend(&self, delivery: &Delivery, visibility: Duration) -> TransportResult<bool> {
            self.0.extend(delivery, visibility).await
        }

        async fn dead_letter(
            &self,
            delivery: &Delivery,
            failures: u32,
            reason: &str,
        ) -> TransportResult<()> {
            self.0.dead_letter(delivery, failures, reason).await
        }

        async fn dead_letters(&self, queue: Option<&str>) -> TransportResult<Vec<DeadLetter>> {
            self.0.dead_letters(queue).await
        }

        async fn pending(&self, queue: &str) -> TransportResult<usize> {
            self.0.pending(queue).await
        }

        fn name(&self) -> &'static str {
            "queue-outage"
        }
    }

    fn storage(id: &str, sync_status: SyncStatus) -> StorageRecord {
        StorageRecord {
            id: id.to_string(),
            name: id.to_string(),
            vendor: "fake".to_string(),
            model: "storage".to_string(),
            serial_number: None,
            status: StorageStatus::Normal,
            sync_status,
            total_capacity: 0,
            used_capacity: 0,
            pool_count: 0,
            volume_count: 0,
            created_at: Utc::now(),
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_failed_sync_request_keeps_previous_status() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_storage(storage("array-1", SyncStatus::Syncing)).await.unwrap();
        store.upsert_storage(storage("array-2", SyncStatus::Synced)).await.unwrap();
        let state = ApiState::new(
            store.clone(),
            Arc::new(QueueOutage(MemoryTransport::new(Duration::from_secs(60)))),
            Arc::new(DriverManager::new()),
            BackendHealth::new(),
            RetryPolicy::default(),
        );
        let app = router(&config(None), state);

        for id in ["array-1", "array-2"] {
            let response = app
                .clone()
                .oneshot(
                    Request::post(format!("/v1/storages/{id}/sync"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        // A sync already running stays marked as running
        let running = store.get_storage("array-1").await.unwrap().unwrap();
        assert_eq!(running.sync_status, SyncStatus::Syncing);
        let idle = store.get_storage("array-2").await.unwrap().unwrap();
        assert_eq!(idle.sync_status, SyncStatus::Synced);
    }
}
