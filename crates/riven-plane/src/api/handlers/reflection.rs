//! Reflection submission handler

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::api::error::ApiError;

/// Request to append an opaque payload to the reflection log
#[derive(Debug, Deserialize)]
pub struct SubmitReflectionRequest {
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitReflectionResponse {
    pub accepted: bool,

    /// Sequence number of the new entry
    pub sequence: u64,
}

/// Submit a reflection
///
/// POST /v1/reflections
pub async fn submit_reflection(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitReflectionRequest>,
) -> Result<Json<SubmitReflectionResponse>, ApiError> {
    let sequence = state.kernel.submit_reflection(request.payload).await?;
    info!(sequence, "Accepted reflection");

    Ok(Json(SubmitReflectionResponse {
        accepted: true,
        sequence,
    }))
}
