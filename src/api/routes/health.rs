//! Health check endpoint

use axum::{Json, extract::State, http::StatusCode};

use crate::api::{state::ApiState, types::HealthResponse};
use crate::retry::HealthState;

/// GET /v1/health
///
/// `503` once a backend exceeded its retry ceiling; the process is about to
/// exit and be restarted.
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.store.health_check().await {
        Ok(status) if status.healthy => "ok".to_string(),
        Ok(status) => status.message,
        Err(e) => e.to_string(),
    };

    let (code, status, reason) = match state.health.state() {
        HealthState::Healthy => (StatusCode::OK, "ok", None),
        HealthState::Unhealthy { reason } => {
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", Some(reason))
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            reason,
            store,
            transport: state.transport.name().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
