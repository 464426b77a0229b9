//! Dead-letter inspection

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use crate::api::{error::ApiResult, state::ApiState, types::DeadLettersResponse};

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    /// Only letters that came from this queue
    queue: Option<String>,
}

/// GET /v1/dead-letters?queue=
///
/// Newest first.
pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<DeadLettersResponse>> {
    let dead_letters = state.transport.dead_letters(query.queue.as_deref()).await?;

    Ok(Json(DeadLettersResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}
