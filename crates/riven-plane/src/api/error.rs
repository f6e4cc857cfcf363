//! API error types and responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use riven_core::{ErrorKind, TrustError};
use serde::Serialize;
use thiserror::Error;

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Integrity failure; details never leave the kernel
    #[error("trust check failed")]
    TrustCheckFailed,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// API error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            ApiError::Forbidden {
                code,
                message,
                details,
            } => (StatusCode::FORBIDDEN, code, message, details),
            ApiError::TrustCheckFailed => (
                StatusCode::FORBIDDEN,
                "TRUST_CHECK_FAILED",
                "trust check failed".to_string(),
                None,
            ),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                msg,
                None,
            ),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

fn policy_code(err: &TrustError) -> &'static str {
    match err {
        TrustError::BlessingDenied(_) => "BLESSING_DENIED",
        TrustError::DepthExceeded { .. } => "DEPTH_EXCEEDED",
        TrustError::FanoutExceeded { .. } => "FANOUT_EXCEEDED",
        TrustError::ScoreTooLow { .. } => "SCORE_TOO_LOW",
        TrustError::PairingDowngrade { .. } => "PAIRING_DOWNGRADE",
        TrustError::AlreadyBound(_) => "ALREADY_BOUND",
        TrustError::ChainCycle => "CHAIN_CYCLE",
        TrustError::InvalidTransition(_) => "INVALID_TRANSITION",
        TrustError::Revoked => "REVOKED",
        TrustError::NotProvisioned => "NOT_PROVISIONED",
        TrustError::NotFound(_) => "NOT_FOUND",
        _ => "FORBIDDEN",
    }
}

impl From<TrustError> for ApiError {
    fn from(err: TrustError) -> Self {
        match err.kind() {
            ErrorKind::Format => ApiError::BadRequest(err.to_string()),
            ErrorKind::Integrity => ApiError::TrustCheckFailed,
            ErrorKind::Transient => ApiError::Unavailable(err.to_string()),
            ErrorKind::Policy => {
                let details = match &err {
                    TrustError::BlessingDenied(reason) => {
                        Some(serde_json::json!({ "reason": reason.as_str() }))
                    }
                    TrustError::ScoreTooLow { score, threshold } => {
                        Some(serde_json::json!({ "score": score, "threshold": threshold }))
                    }
                    _ => None,
                };
                ApiError::Forbidden {
                    code: policy_code(&err),
                    message: err.to_string(),
                    details,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riven_core::{DenyReason, IntegrityFault};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (TrustError::MalformedToken("x".into()), StatusCode::BAD_REQUEST),
            (
                TrustError::BlessingDenied(DenyReason::NotBlessed),
                StatusCode::FORBIDDEN,
            ),
            (TrustError::TrustCheckFailed, StatusCode::FORBIDDEN),
            (
                TrustError::StorageUnavailable("timeout".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_integrity_details_are_hidden() {
        let err = ApiError::from(TrustError::Integrity(IntegrityFault::BindingMismatch));
        assert!(matches!(err, ApiError::TrustCheckFailed));
        assert_eq!(err.to_string(), "trust check failed");
    }
}
