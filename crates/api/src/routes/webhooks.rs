//! Provider webhook endpoint.
//!
//! Contract: an accepted delivery (including an idempotent replay) is
//! acknowledged with 200 so the PSP stops redelivering. A signature or
//! parse failure is a 400 so the PSP treats the delivery as malformed.
//! A handler failure is NOT a request failure: the event is stored and
//! retried by the sweeper, and the provider still sees the ack.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use semo_billing::Ingestion;
use semo_shared::PaymentProvider;

use crate::error::ApiError;
use crate::state::AppState;

/// Signature header per provider.
fn signature_header(provider: PaymentProvider) -> &'static str {
    match provider {
        PaymentProvider::Stripe => "stripe-signature",
        PaymentProvider::Toss => "toss-signature",
    }
}

pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider: PaymentProvider = provider
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown payment provider: {provider}")))?;

    let signature = headers
        .get(signature_header(provider))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(provider = %provider, "Webhook missing signature header");
            ApiError::BadRequest("missing signature header".to_string())
        })?;

    tracing::info!(
        provider = %provider,
        body_len = body.len(),
        "Webhook received"
    );

    let ingestion = state
        .billing
        .processor
        .ingest(provider, &body, signature)
        .await?;

    let response = match ingestion {
        Ingestion::Accepted { event_id } => {
            serde_json::json!({"status": "accepted", "event_id": event_id})
        }
        Ingestion::Duplicate { event_id } => {
            serde_json::json!({"status": "duplicate", "event_id": event_id})
        }
    };
    Ok(Json(response))
}
