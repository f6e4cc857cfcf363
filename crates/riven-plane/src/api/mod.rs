//! HTTP plane for one vault

pub mod error;
pub mod handlers;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::kernel::VaultState;
use handlers::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness check response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub state: VaultState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

/// Health check endpoint
///
/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Readiness check endpoint
///
/// GET /ready
///
/// Ready once the vault is provisioned and not revoked.
pub async fn ready(State(state): State<Arc<AppState>>) -> Json<ReadyResponse> {
    let vault_state = state
        .kernel
        .status()
        .await
        .map(|status| status.state)
        .unwrap_or(VaultState::Revoked);

    Json(ReadyResponse {
        ready: vault_state == VaultState::Active,
        state: vault_state,
        name: state.config.name.clone(),
        public_url: state.config.public_url.clone(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/blessing/check", post(handlers::check_blessing))
        .route("/v1/reflections", post(handlers::submit_reflection))
        .route("/v1/mirrors", post(handlers::spawn_mirror))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
