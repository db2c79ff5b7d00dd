//! Durable store for inbound provider notifications and the retry state
//! machine that re-schedules failed ones.
//!
//! "Durably received" is decoupled from "fully applied": an event that
//! fails mid-processing stays in the store with a due time and is picked up
//! again by the sweeper. Retry scheduling lives entirely in persisted state
//! (`next_retry_at`), so it survives process restarts. Dedup here is
//! independent of ledger-level idempotency: a redelivered event is dropped
//! at the storage layer before any handler runs.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// First retry delay, in minutes. Doubles on every failure.
const BASE_RETRY_MINUTES: i64 = 5;
/// Backoff ceiling: 24 hours.
const MAX_RETRY_MINUTES: i64 = 24 * 60;
/// An event stuck in `processing` longer than this is considered abandoned
/// by a crashed worker and becomes claimable again.
const STUCK_PROCESSING_MINUTES: i32 = 15;

/// Processing lifecycle of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// Exponential backoff: `5min × 2^retry_count`, capped at 24 hours.
///
/// `retry_count` is the pre-increment failure count, so the first failure
/// schedules +5min, then +10, +20, +40 and so on.
pub fn retry_delay(retry_count: i32) -> time::Duration {
    let exponent = retry_count.clamp(0, 16) as u32;
    let minutes = BASE_RETRY_MINUTES
        .saturating_mul(1i64 << exponent)
        .min(MAX_RETRY_MINUTES);
    time::Duration::minutes(minutes)
}

/// One stored provider notification.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct StoredWebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub provider: String,
    pub event_type: String,
    pub canonical_status: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<OffsetDateTime>,
    pub payload: serde_json::Value,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

const EVENT_COLUMNS: &str = "id, event_id, provider, event_type, canonical_status, status, \
     retry_count, last_error, next_retry_at, payload, received_at, processed_at";

#[derive(Clone)]
pub struct WebhookEventStore {
    pool: PgPool,
}

impl WebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-if-absent keyed by the provider event id. Returns `false` for
    /// a duplicate delivery, which is a silent no-op.
    pub async fn save_event(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        canonical_status: Option<&str>,
        payload: &serde_json::Value,
    ) -> BillingResult<bool> {
        if event_id.is_empty() {
            return Err(BillingError::Validation(
                "webhook event id must not be empty".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, provider, event_type, canonical_status, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(provider)
        .bind(event_type)
        .bind(canonical_status)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            tracing::info!(
                event_id = event_id,
                provider = provider,
                "Duplicate webhook delivery, already stored"
            );
        }
        Ok(inserted)
    }

    /// Atomically claim an event for processing.
    ///
    /// Only an event that is pending, failed-and-due, or stuck in
    /// `processing` past the abandonment window transitions; `None` means
    /// another worker holds it or it is already completed. This closes the
    /// race where two sweepers pick up the same due event.
    pub async fn claim_for_processing(
        &self,
        event_id: &str,
    ) -> BillingResult<Option<StoredWebhookEvent>> {
        let row: Option<StoredWebhookEvent> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'processing', processing_started_at = NOW()
            WHERE event_id = $1
              AND (
                    (status IN ('pending', 'failed')
                     AND (next_retry_at IS NULL OR next_retry_at <= NOW()))
                 OR (status = 'processing'
                     AND processing_started_at < NOW() - ($2 || ' minutes')::INTERVAL)
              )
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(STUCK_PROCESSING_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Terminal success: status=completed, processed_at stamped.
    pub async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'completed', processed_at = NOW(), last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "webhook event {event_id} not found"
            )));
        }
        Ok(())
    }

    /// Record a handler failure and schedule the next attempt.
    ///
    /// Reads the current retry count, computes the backoff from it, then
    /// increments. Safe against concurrent writers because an event is only
    /// ever failed by the worker that claimed it.
    pub async fn mark_failed(&self, event_id: &str, error: &str) -> BillingResult<()> {
        let retry_count: Option<i32> =
            sqlx::query_scalar("SELECT retry_count FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(retry_count) = retry_count else {
            return Err(BillingError::NotFound(format!(
                "webhook event {event_id} not found"
            )));
        };

        let delay = retry_delay(retry_count);

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed',
                retry_count = $2,
                last_error = $3,
                next_retry_at = NOW() + ($4 || ' minutes')::INTERVAL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(retry_count + 1)
        .bind(error)
        .bind(delay.whole_minutes())
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            event_id = event_id,
            retry_count = retry_count + 1,
            next_retry_minutes = delay.whole_minutes(),
            error = error,
            "Webhook event failed, retry scheduled"
        );
        Ok(())
    }

    /// Events owed a processing attempt: pending or failed with a due (or
    /// absent) retry time, plus events abandoned mid-processing by a
    /// crashed worker. Oldest received first; consumed by the sweeper.
    pub async fn pending_events(&self, limit: i64) -> BillingResult<Vec<StoredWebhookEvent>> {
        let rows: Vec<StoredWebhookEvent> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE (status IN ('pending', 'failed')
                   AND (next_retry_at IS NULL OR next_retry_at <= NOW()))
               OR (status = 'processing'
                   AND processing_started_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY received_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit.clamp(1, 500))
        .bind(STUCK_PROCESSING_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<StoredWebhookEvent>> {
        let row: Option<StoredWebhookEvent> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE event_id = $1
            "#
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Drop completed events older than the retention window. Returns the
    /// number of rows removed.
    pub async fn delete_completed_older_than_days(&self, days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE status = 'completed'
              AND received_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
