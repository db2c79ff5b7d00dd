//! HTTP error mapping.
//!
//! The split that matters at this boundary: verification/parse failures
//! are client errors so the provider treats the delivery as non-retryable
//! malformed input, while "failed to apply" never surfaces here at all.
//! It is recorded on the stored event and retried internally.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use semo_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(serde_json::Value),
    #[error("internal error")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::BadRequest(msg),
            BillingError::ProviderVerification(msg) => ApiError::BadRequest(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InsufficientBalance {
                requested,
                available,
            } => ApiError::Conflict(serde_json::json!({
                "error": "insufficient_balance",
                "requested": requested,
                "available": available,
            })),
            BillingError::Database(e) => ApiError::Internal(e.to_string()),
            BillingError::Config(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::Conflict(body) => (StatusCode::CONFLICT, Json(body)).into_response(),
            ApiError::Internal(msg) => {
                // Persistence detail stays in the logs, not the response.
                tracing::error!(error = %msg, "Internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}
