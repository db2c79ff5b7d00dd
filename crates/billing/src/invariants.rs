//! Runnable consistency checks for the credit ledger.
//!
//! Each invariant is a real SQL query that only reads, never writes, and a
//! violation carries enough context to debug. Safe to run after any
//! mutation or webhook replay; the worker runs the full set on a schedule.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Subjects affected.
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    /// Severity level.
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - balances are wrong, credits may be granted or lost.
    Critical,
    /// High - data inconsistency that needs attention.
    High,
    /// Medium - potential issue, should investigate.
    Medium,
    /// Low - minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    subject_id: Uuid,
    provider: String,
    cached: rust_decimal::Decimal,
    ledger_sum: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    subject_id: Uuid,
    provider: String,
    current_balance: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct BrokenChainRow {
    subject_id: Uuid,
    provider: String,
    transaction_id: Uuid,
    amount: rust_decimal::Decimal,
    balance_after: rust_decimal::Decimal,
    prev_after: rust_decimal::Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateReferenceRow {
    subject_id: Uuid,
    provider: String,
    reference_id: String,
    occurrences: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    event_id: String,
    provider: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and aggregate the outcome.
    pub async fn check_all(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let mut checks_run = 0;
        let mut checks_failed = 0;

        for result in [
            self.check_balance_matches_ledger_sum().await?,
            self.check_balance_after_chain().await?,
            self.check_no_negative_balances().await?,
            self.check_unique_allocation_references().await?,
            self.check_no_stuck_processing_events().await?,
        ] {
            checks_run += 1;
            if let Some(violation) = result {
                checks_failed += 1;
                violations.push(violation);
            }
        }

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// The balance cache must equal the running sum of that pair's
    /// transactions at every point in time.
    async fn check_balance_matches_ledger_sum(
        &self,
    ) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT b.subject_id,
                   b.provider,
                   b.current_balance AS cached,
                   COALESCE(SUM(t.amount), 0) AS ledger_sum
            FROM credit_balances b
            LEFT JOIN credit_transactions t
              ON t.subject_id = b.subject_id AND t.provider = b.provider
            GROUP BY b.subject_id, b.provider, b.current_balance
            HAVING b.current_balance <> COALESCE(SUM(t.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(InvariantViolation {
            invariant: "balance_matches_ledger_sum".to_string(),
            subject_ids: rows.iter().map(|r| r.subject_id).collect(),
            description: format!(
                "{} balance rows disagree with their transaction sum",
                rows.len()
            ),
            context: serde_json::json!(rows
                .iter()
                .map(|r| serde_json::json!({
                    "subject_id": r.subject_id,
                    "provider": r.provider,
                    "cached": r.cached,
                    "ledger_sum": r.ledger_sum,
                }))
                .collect::<Vec<_>>()),
            severity: ViolationSeverity::Critical,
        }))
    }

    /// Every entry must snapshot the running sum: `balance_after` equals
    /// the prior entry's `balance_after` (zero when none exists) plus the
    /// entry's own amount, per (subject, provider), in ledger order.
    async fn check_balance_after_chain(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<BrokenChainRow> = sqlx::query_as(
            r#"
            SELECT subject_id, provider, transaction_id, amount, balance_after, prev_after
            FROM (
                SELECT subject_id,
                       provider,
                       id AS transaction_id,
                       amount,
                       balance_after,
                       LAG(balance_after, 1, 0::NUMERIC) OVER (
                           PARTITION BY subject_id, provider
                           ORDER BY created_at, id
                       ) AS prev_after
                FROM credit_transactions
            ) chain
            WHERE balance_after <> prev_after + amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(InvariantViolation {
            invariant: "balance_after_chain".to_string(),
            subject_ids: rows.iter().map(|r| r.subject_id).collect(),
            description: format!(
                "{} transactions break the balance_after continuity chain",
                rows.len()
            ),
            context: serde_json::json!(rows
                .iter()
                .map(|r| serde_json::json!({
                    "subject_id": r.subject_id,
                    "provider": r.provider,
                    "transaction_id": r.transaction_id,
                    "amount": r.amount,
                    "balance_after": r.balance_after,
                    "prev_after": r.prev_after,
                }))
                .collect::<Vec<_>>()),
            severity: ViolationSeverity::Critical,
        }))
    }

    async fn check_no_negative_balances(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT subject_id, provider, current_balance
            FROM credit_balances
            WHERE current_balance < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(InvariantViolation {
            invariant: "no_negative_balances".to_string(),
            subject_ids: rows.iter().map(|r| r.subject_id).collect(),
            description: format!("{} balances are negative", rows.len()),
            context: serde_json::json!(rows
                .iter()
                .map(|r| serde_json::json!({
                    "subject_id": r.subject_id,
                    "provider": r.provider,
                    "current_balance": r.current_balance,
                }))
                .collect::<Vec<_>>()),
            severity: ViolationSeverity::Critical,
        }))
    }

    /// Belt and braces over the partial unique index: a duplicated
    /// allocation reference means the idempotency guarantee broke.
    async fn check_unique_allocation_references(
        &self,
    ) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<DuplicateReferenceRow> = sqlx::query_as(
            r#"
            SELECT subject_id, provider, reference_id, COUNT(*) AS occurrences
            FROM credit_transactions
            WHERE reference_id IS NOT NULL
            GROUP BY subject_id, provider, reference_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(InvariantViolation {
            invariant: "unique_allocation_references".to_string(),
            subject_ids: rows.iter().map(|r| r.subject_id).collect(),
            description: format!("{} allocation references are duplicated", rows.len()),
            context: serde_json::json!(rows
                .iter()
                .map(|r| serde_json::json!({
                    "subject_id": r.subject_id,
                    "provider": r.provider,
                    "reference_id": r.reference_id,
                    "occurrences": r.occurrences,
                }))
                .collect::<Vec<_>>()),
            severity: ViolationSeverity::High,
        }))
    }

    /// Events held in `processing` for more than an hour outlived both the
    /// claim window and any plausible handler run.
    async fn check_no_stuck_processing_events(
        &self,
    ) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, provider, processing_started_at
            FROM webhook_events
            WHERE status = 'processing'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(InvariantViolation {
            invariant: "no_stuck_processing_events".to_string(),
            subject_ids: Vec::new(),
            description: format!("{} webhook events stuck in processing", rows.len()),
            context: serde_json::json!(rows
                .iter()
                .map(|r| serde_json::json!({
                    "event_id": r.event_id,
                    "provider": r.provider,
                    "processing_started_at": r.processing_started_at,
                }))
                .collect::<Vec<_>>()),
            severity: ViolationSeverity::Medium,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display_is_uppercase() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn summary_serializes() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::UNIX_EPOCH,
            checks_run: 5,
            checks_passed: 5,
            checks_failed: 0,
            violations: Vec::new(),
            healthy: true,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"healthy\":true"));
        assert!(json.contains("\"checks_run\":5"));
    }
}
