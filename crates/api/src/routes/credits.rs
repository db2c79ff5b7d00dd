//! Credit operation endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use semo_billing::{AppliedTransaction, CreditBalance, CreditTransaction};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub provider: String,
    pub amount: Decimal,
    pub description: String,
    pub reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UseRequest {
    pub provider: String,
    pub amount: Decimal,
    pub description: String,
    pub feature: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub provider: String,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Always succeeds: an unknown (subject, provider) pair reads as zero.
pub async fn get_balance(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CreditBalance>, ApiError> {
    let balance = state
        .billing
        .ledger
        .get_balance(subject_id, &query.provider)
        .await?;
    Ok(Json(balance))
}

pub async fn allocate(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<AppliedTransaction>, ApiError> {
    let applied = state
        .billing
        .ledger
        .allocate(
            subject_id,
            &request.provider,
            request.amount,
            &request.description,
            request.reference_id.as_deref(),
        )
        .await?;
    Ok(Json(applied))
}

/// Rejected with 409 and the exact shortfall when the balance is short;
/// never partially debited.
pub async fn use_credits(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
    Json(request): Json<UseRequest>,
) -> Result<Json<AppliedTransaction>, ApiError> {
    let applied = state
        .billing
        .ledger
        .use_credits(
            subject_id,
            &request.provider,
            request.amount,
            &request.description,
            request.feature.as_deref(),
            request.idempotency_key.as_deref(),
        )
        .await?;
    Ok(Json(applied))
}

pub async fn adjust(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<AppliedTransaction>, ApiError> {
    let applied = state
        .billing
        .ledger
        .adjust(
            subject_id,
            &request.provider,
            request.amount,
            &request.description,
        )
        .await?;
    Ok(Json(applied))
}

pub async fn history(
    State(state): State<AppState>,
    Path(subject_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CreditTransaction>>, ApiError> {
    let transactions = state
        .billing
        .ledger
        .transaction_history(
            subject_id,
            query.limit.unwrap_or(50),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(transactions))
}
