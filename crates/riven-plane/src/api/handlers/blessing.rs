//! Blessing check handler

use axum::{extract::State, Json};
use riven_core::{DeviceId, PropagationDecision};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;
use crate::api::error::ApiError;

/// Request to check whether an identity may spawn
#[derive(Debug, Deserialize)]
pub struct BlessingCheckRequest {
    /// Hex vault or mirror identifier
    pub identity: String,
}

#[derive(Debug, Serialize)]
pub struct BlessingCheckResponse {
    /// `allow` or `deny`
    pub decision: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<PropagationDecision> for BlessingCheckResponse {
    fn from(decision: PropagationDecision) -> Self {
        match decision {
            PropagationDecision::Allow => Self {
                decision: "allow",
                reason: None,
            },
            PropagationDecision::Deny(reason) => Self {
                decision: "deny",
                reason: Some(reason.as_str()),
            },
        }
    }
}

/// Check propagation rights
///
/// POST /v1/blessing/check
///
/// A denial is a successful answer; only malformed input and kernel failures are errors.
pub async fn check_blessing(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BlessingCheckRequest>,
) -> Result<Json<BlessingCheckResponse>, ApiError> {
    let identity: DeviceId = request.identity.parse()?;
    let decision = state.kernel.request_blessing_check(&identity).await?;
    Ok(Json(decision.into()))
}
