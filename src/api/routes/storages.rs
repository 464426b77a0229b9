//! Storage registry endpoints
//!
//! Everything but the listing only enqueues work for the Task and Alert
//! roles and answers `202 Accepted` with the message ids.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{AcceptedResponse, QueuedMessage, RegisterStorageRequest, StorageView, StoragesResponse},
};
use crate::handlers::storage_sync::DiscoverRequest;
use crate::storage::SyncStatus;
use crate::{Operation, WorkMessage};

type Accepted = (StatusCode, Json<AcceptedResponse>);

fn accepted(storage_id: &str, messages: &[WorkMessage]) -> Accepted {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            storage_id: storage_id.to_string(),
            messages: messages
                .iter()
                .map(|m| QueuedMessage {
                    message_id: m.id,
                    operation: m.operation,
                })
                .collect(),
        }),
    )
}

async fn require_storage(state: &ApiState, id: &str) -> ApiResult<()> {
    match state.store.get_storage(id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound(format!("storage {id}"))),
    }
}

/// GET /v1/storages
pub async fn list_storages(State(state): State<ApiState>) -> ApiResult<Json<StoragesResponse>> {
    let storages: Vec<StorageView> = state
        .store
        .list_storages()
        .await?
        .into_iter()
        .map(StorageView::from)
        .collect();

    Ok(Json(StoragesResponse {
        count: storages.len(),
        storages,
    }))
}

/// POST /v1/storages
///
/// Enqueues a `discover` for the storage.
pub async fn register_storage(
    State(state): State<ApiState>,
    Json(request): Json<RegisterStorageRequest>,
) -> ApiResult<Accepted> {
    if request.storage_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("storage_id must not be empty".to_string()));
    }
    if !state.drivers.supports(&request.vendor, &request.model) {
        return Err(ApiError::InvalidRequest(format!(
            "no driver for vendor '{}' model '{}'",
            request.vendor, request.model
        )));
    }

    let discover = DiscoverRequest {
        name: request.name.unwrap_or_else(|| request.storage_id.clone()),
        vendor: request.vendor,
        model: request.model,
    };
    let payload = serde_json::to_value(&discover).map_err(anyhow::Error::from)?;
    let message = WorkMessage::new(&request.storage_id, Operation::Discover, payload);

    state.enqueue(&message).await?;
    info!("discovery of {} requested", request.storage_id);

    Ok(accepted(&request.storage_id, &[message]))
}

/// POST /v1/storages/:id/sync
///
/// Marks the record SYNCING; the Task role's commit flips it back.
pub async fn sync_storage(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Accepted> {
    let previous = match state.store.get_storage(&id).await? {
        Some(record) => record.sync_status,
        None => return Err(ApiError::NotFound(format!("storage {id}"))),
    };
    if !state.store.set_sync_status(&id, SyncStatus::Syncing).await? {
        return Err(ApiError::NotFound(format!("storage {id}")));
    }

    let message = WorkMessage::new(&id, Operation::SyncResources, Value::Null);
    if let Err(e) = state.enqueue(&message).await {
        if let Err(revert) = state.store.set_sync_status(&id, previous).await {
            warn!("could not restore sync status of {id}: {revert}");
        }
        return Err(e.into());
    }

    Ok(accepted(&id, &[message]))
}

/// DELETE /v1/storages/:id
///
/// Enqueues `remove_resources` followed by `remove_from_cache`.
pub async fn delete_storage(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Accepted> {
    require_storage(&state, &id).await?;

    let messages = [
        WorkMessage::new(&id, Operation::RemoveResources, Value::Null),
        WorkMessage::new(&id, Operation::RemoveFromCache, Value::Null),
    ];
    for message in &messages {
        state.enqueue(message).await?;
    }
    info!("removal of {id} requested");

    Ok(accepted(&id, &messages))
}

/// POST /v1/storages/:id/alerts
///
/// The body is the raw alert as sent by the array; the storage's driver
/// parses it in the Alert role.
pub async fn post_alert(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(raw): Json<Value>,
) -> ApiResult<Accepted> {
    if !raw.is_object() {
        return Err(ApiError::InvalidRequest("alert body must be a JSON object".to_string()));
    }
    require_storage(&state, &id).await?;

    let message = WorkMessage::new(&id, Operation::ProcessAlert, raw);
    state.enqueue(&message).await?;

    Ok(accepted(&id, &[message]))
}
