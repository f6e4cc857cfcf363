//! Mirror spawn handler

use axum::{extract::State, Json};
use riven_core::{DeviceId, MirrorConfig, MirrorLineage};
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;
use crate::api::error::ApiError;

/// Request to spawn a mirror
#[derive(Debug, Deserialize)]
pub struct SpawnMirrorRequest {
    /// Hex identifier of the parent; the genesis vault if omitted
    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub config: MirrorConfig,

    /// Retries with the same key return the original lineage
    pub idempotency_key: String,
}

/// Spawn a mirror
///
/// POST /v1/mirrors
pub async fn spawn_mirror(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpawnMirrorRequest>,
) -> Result<Json<MirrorLineage>, ApiError> {
    let parent = request
        .parent
        .as_deref()
        .map(str::parse::<DeviceId>)
        .transpose()?;

    let lineage = state
        .kernel
        .spawn_mirror_request(parent, &request.config, &request.idempotency_key)
        .await?;
    Ok(Json(lineage))
}
