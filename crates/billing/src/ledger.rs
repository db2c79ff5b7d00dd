//! Credit ledger: the immutable transaction log and the derived per-subject
//! balance cache.
//!
//! Every balance mutation in the system goes through this service. Each
//! mutating operation runs in a single database transaction that locks the
//! (subject, provider) balance row, so concurrent mutations for different
//! subjects proceed in parallel while mutations for the same subject
//! serialize. Idempotency for webhook-driven allocations is enforced by a
//! partial unique index on the reference id, not by a SELECT-then-INSERT:
//! a concurrent duplicate surfaces as a conflict inside the transaction and
//! is converted into a replay result, never a second credit.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};

/// Maximum page size for transaction history queries.
const MAX_HISTORY_PAGE: i64 = 100;

/// Ledger entry types. Stored as text; `as_str` is the storage form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Allocation,
    Usage,
    Refund,
    Adjustment,
    SubscriptionCancellation,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Allocation => "allocation",
            TransactionType::Usage => "usage",
            TransactionType::Refund => "refund",
            TransactionType::Adjustment => "adjustment",
            TransactionType::SubscriptionCancellation => "subscription_cancellation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allocation" => Some(TransactionType::Allocation),
            "usage" => Some(TransactionType::Usage),
            "refund" => Some(TransactionType::Refund),
            "adjustment" => Some(TransactionType::Adjustment),
            "subscription_cancellation" => Some(TransactionType::SubscriptionCancellation),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current balance for one (subject, provider) pair.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CreditBalance {
    pub subject_id: Uuid,
    pub provider: String,
    pub current_balance: Decimal,
    pub last_transaction_at: Option<OffsetDateTime>,
}

impl CreditBalance {
    /// Synthetic zero balance for a pair that has no row yet. Balance
    /// queries never fail on absence.
    fn zero(subject_id: Uuid, provider: &str) -> Self {
        Self {
            subject_id,
            provider: provider.to_string(),
            current_balance: Decimal::ZERO,
            last_transaction_at: None,
        }
    }
}

/// One immutable ledger entry. Rows are never updated or deleted.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub provider: String,
    pub transaction_type: String,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub feature: Option<String>,
    pub reference_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Result of a ledger mutation. `replayed` marks an idempotent no-op: the
/// returned transaction is the previously recorded one and no balance
/// change happened on this call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppliedTransaction {
    pub balance: CreditBalance,
    pub transaction: CreditTransaction,
    pub replayed: bool,
}

const TRANSACTION_COLUMNS: &str = "id, subject_id, provider, transaction_type, amount, \
     balance_after, description, feature, reference_id, idempotency_key, created_at";

/// The credit ledger service.
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self { pool, event_logger }
    }

    /// Get the current balance. Returns a synthetic zero balance when no
    /// row exists; never an error for absence.
    pub async fn get_balance(
        &self,
        subject_id: Uuid,
        provider: &str,
    ) -> BillingResult<CreditBalance> {
        let row: Option<CreditBalance> = sqlx::query_as(
            r#"
            SELECT subject_id, provider, current_balance, last_transaction_at
            FROM credit_balances
            WHERE subject_id = $1 AND provider = $2
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or_else(|| CreditBalance::zero(subject_id, provider)))
    }

    /// Credit `amount` to the subject's balance.
    ///
    /// When `reference_id` is present the operation is idempotent: a replay
    /// (same reference) returns the previously recorded transaction and the
    /// current balance, with no new ledger entry.
    pub async fn allocate(
        &self,
        subject_id: Uuid,
        provider: &str,
        amount: Decimal,
        description: &str,
        reference_id: Option<&str>,
    ) -> BillingResult<AppliedTransaction> {
        validate_provider(provider)?;
        validate_positive(amount)?;

        // Fast path for redeliveries: an existing transaction with this
        // reference means the credit was already applied.
        if let Some(reference) = reference_id {
            if let Some(existing) = self.find_by_reference(subject_id, provider, reference).await? {
                return self.replay(existing, "allocation").await;
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO credit_balances (subject_id, provider)
            VALUES ($1, $2)
            ON CONFLICT (subject_id, provider) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .execute(&mut *tx)
        .await?;

        let current: Decimal = sqlx::query_scalar(
            r#"
            SELECT current_balance FROM credit_balances
            WHERE subject_id = $1 AND provider = $2
            FOR UPDATE
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .fetch_one(&mut *tx)
        .await?;

        let new_balance = current + amount;

        // The fast-path check above races with concurrent allocations using
        // the same reference; the partial unique index is the arbiter. A
        // conflict here means another transaction already applied this
        // reference, so this one rolls back and replays.
        let inserted: Option<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_transactions
                (subject_id, provider, transaction_type, amount, balance_after,
                 description, reference_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subject_id, provider, reference_id)
                WHERE reference_id IS NOT NULL
                DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(TransactionType::Allocation.as_str())
        .bind(amount)
        .bind(new_balance)
        .bind(description)
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction) = inserted else {
            tx.rollback().await?;
            let reference = reference_id.unwrap_or_default();
            let existing = self
                .find_by_reference(subject_id, provider, reference)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!(
                        "allocation {reference} vanished after conflict"
                    ))
                })?;
            return self.replay(existing, "allocation").await;
        };

        let balance = self
            .write_balance(&mut tx, subject_id, provider, new_balance)
            .await?;
        tx.commit().await?;

        tracing::info!(
            subject_id = %subject_id,
            provider = provider,
            amount = %amount,
            balance = %balance.current_balance,
            reference_id = ?reference_id,
            "Credits allocated"
        );
        self.event_logger
            .log(
                BillingEventType::CreditsAllocated,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "amount": amount,
                    "balance_after": balance.current_balance,
                    "reference_id": reference_id,
                }),
            )
            .await;

        Ok(AppliedTransaction {
            balance,
            transaction,
            replayed: false,
        })
    }

    /// Debit `amount` from the subject's balance.
    ///
    /// Fails with `NotFound` when the balance row does not exist and with
    /// `InsufficientBalance` (carrying the exact shortfall) when it holds
    /// less than requested; in both cases the ledger is untouched.
    pub async fn use_credits(
        &self,
        subject_id: Uuid,
        provider: &str,
        amount: Decimal,
        description: &str,
        feature: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<AppliedTransaction> {
        validate_provider(provider)?;
        validate_positive(amount)?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .find_by_idempotency_key(subject_id, provider, key)
                .await?
            {
                return self.replay(existing, "usage").await;
            }
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<CreditBalance> = sqlx::query_as(
            r#"
            SELECT subject_id, provider, current_balance, last_transaction_at
            FROM credit_balances
            WHERE subject_id = $1 AND provider = $2
            FOR UPDATE
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = row else {
            return Err(BillingError::NotFound(format!(
                "no credit balance for subject {subject_id} provider {provider}"
            )));
        };

        if current.current_balance < amount {
            return Err(BillingError::InsufficientBalance {
                requested: amount,
                available: current.current_balance,
            });
        }

        let new_balance = current.current_balance - amount;

        let inserted: Option<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_transactions
                (subject_id, provider, transaction_type, amount, balance_after,
                 description, feature, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subject_id, provider, idempotency_key)
                WHERE idempotency_key IS NOT NULL
                DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(TransactionType::Usage.as_str())
        .bind(-amount)
        .bind(new_balance)
        .bind(description)
        .bind(feature)
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction) = inserted else {
            tx.rollback().await?;
            let key = idempotency_key.unwrap_or_default();
            let existing = self
                .find_by_idempotency_key(subject_id, provider, key)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("usage {key} vanished after conflict"))
                })?;
            return self.replay(existing, "usage").await;
        };

        let balance = self
            .write_balance(&mut tx, subject_id, provider, new_balance)
            .await?;
        tx.commit().await?;

        tracing::info!(
            subject_id = %subject_id,
            provider = provider,
            amount = %amount,
            balance = %balance.current_balance,
            feature = ?feature,
            "Credits used"
        );
        self.event_logger
            .log(
                BillingEventType::CreditsUsed,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "amount": amount,
                    "balance_after": balance.current_balance,
                    "feature": feature,
                }),
            )
            .await;

        Ok(AppliedTransaction {
            balance,
            transaction,
            replayed: false,
        })
    }

    /// Reverse a previous allocation identified by its reference id.
    ///
    /// The deduction is clamped to the current balance (never drives it
    /// negative) and recorded under reference `refund:{reference_id}`, so a
    /// redelivered refund event deducts exactly once. Returns `None` when
    /// there is no matching allocation or nothing left to deduct.
    pub async fn refund_allocation(
        &self,
        subject_id: Uuid,
        provider: &str,
        reference_id: &str,
        description: &str,
    ) -> BillingResult<Option<AppliedTransaction>> {
        validate_provider(provider)?;
        if reference_id.is_empty() {
            return Err(BillingError::Validation(
                "refund requires a reference id".to_string(),
            ));
        }

        let Some(allocation) = self
            .find_by_reference(subject_id, provider, reference_id)
            .await?
        else {
            tracing::warn!(
                subject_id = %subject_id,
                provider = provider,
                reference_id = reference_id,
                "Refund for unknown allocation reference, skipping"
            );
            return Ok(None);
        };

        let refund_reference = format!("refund:{reference_id}");
        if let Some(existing) = self
            .find_by_reference(subject_id, provider, &refund_reference)
            .await?
        {
            return self.replay(existing, "refund").await.map(Some);
        }

        let mut tx = self.pool.begin().await?;

        let current: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT current_balance FROM credit_balances
            WHERE subject_id = $1 AND provider = $2
            FOR UPDATE
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current.unwrap_or(Decimal::ZERO);
        let deduction = allocation.amount.min(current);
        if deduction <= Decimal::ZERO {
            return Ok(None);
        }

        let new_balance = current - deduction;

        let inserted: Option<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_transactions
                (subject_id, provider, transaction_type, amount, balance_after,
                 description, reference_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subject_id, provider, reference_id)
                WHERE reference_id IS NOT NULL
                DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(TransactionType::Refund.as_str())
        .bind(-deduction)
        .bind(new_balance)
        .bind(description)
        .bind(&refund_reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_by_reference(subject_id, provider, &refund_reference)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!(
                        "refund {refund_reference} vanished after conflict"
                    ))
                })?;
            return self.replay(existing, "refund").await.map(Some);
        };

        let balance = self
            .write_balance(&mut tx, subject_id, provider, new_balance)
            .await?;
        tx.commit().await?;

        tracing::info!(
            subject_id = %subject_id,
            provider = provider,
            reference_id = reference_id,
            deducted = %deduction,
            "Allocation refunded"
        );
        self.event_logger
            .log(
                BillingEventType::CreditsRefunded,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "reference_id": reference_id,
                    "deducted": deduction,
                    "balance_after": balance.current_balance,
                }),
            )
            .await;

        Ok(Some(AppliedTransaction {
            balance,
            transaction,
            replayed: false,
        }))
    }

    /// Operator correction. `amount` is signed; a negative adjustment may
    /// not drive the balance below zero.
    pub async fn adjust(
        &self,
        subject_id: Uuid,
        provider: &str,
        amount: Decimal,
        description: &str,
    ) -> BillingResult<AppliedTransaction> {
        validate_provider(provider)?;
        if amount == Decimal::ZERO {
            return Err(BillingError::Validation(
                "adjustment amount must be non-zero".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO credit_balances (subject_id, provider)
            VALUES ($1, $2)
            ON CONFLICT (subject_id, provider) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .execute(&mut *tx)
        .await?;

        let current: Decimal = sqlx::query_scalar(
            r#"
            SELECT current_balance FROM credit_balances
            WHERE subject_id = $1 AND provider = $2
            FOR UPDATE
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .fetch_one(&mut *tx)
        .await?;

        let new_balance = current + amount;
        if new_balance < Decimal::ZERO {
            return Err(BillingError::InsufficientBalance {
                requested: -amount,
                available: current,
            });
        }

        let transaction: CreditTransaction = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_transactions
                (subject_id, provider, transaction_type, amount, balance_after, description)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(TransactionType::Adjustment.as_str())
        .bind(amount)
        .bind(new_balance)
        .bind(description)
        .fetch_one(&mut *tx)
        .await?;

        let balance = self
            .write_balance(&mut tx, subject_id, provider, new_balance)
            .await?;
        tx.commit().await?;

        tracing::info!(
            subject_id = %subject_id,
            provider = provider,
            amount = %amount,
            balance = %balance.current_balance,
            "Balance adjusted"
        );
        self.event_logger
            .log(
                BillingEventType::BalanceAdjusted,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "amount": amount,
                    "balance_after": balance.current_balance,
                }),
            )
            .await;

        Ok(AppliedTransaction {
            balance,
            transaction,
            replayed: false,
        })
    }

    /// Transaction history for a subject across all providers, most recent
    /// first. Restartable via `offset`.
    pub async fn transaction_history(
        &self,
        subject_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        if limit <= 0 || offset < 0 {
            return Err(BillingError::Validation(
                "limit must be positive and offset non-negative".to_string(),
            ));
        }
        let limit = limit.min(MAX_HISTORY_PAGE);

        let rows: Vec<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE subject_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(subject_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_reference(
        &self,
        subject_id: Uuid,
        provider: &str,
        reference_id: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        let row: Option<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE subject_id = $1 AND provider = $2 AND reference_id = $3
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_idempotency_key(
        &self,
        subject_id: Uuid,
        provider: &str,
        idempotency_key: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        let row: Option<CreditTransaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE subject_id = $1 AND provider = $2 AND idempotency_key = $3
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Update the balance cache inside the caller's transaction. Always the
    /// same transaction as the ledger insert that produced the change.
    async fn write_balance(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subject_id: Uuid,
        provider: &str,
        new_balance: Decimal,
    ) -> BillingResult<CreditBalance> {
        let balance: CreditBalance = sqlx::query_as(
            r#"
            UPDATE credit_balances
            SET current_balance = $3,
                last_transaction_at = NOW(),
                updated_at = NOW()
            WHERE subject_id = $1 AND provider = $2
            RETURNING subject_id, provider, current_balance, last_transaction_at
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .bind(new_balance)
        .fetch_one(&mut **tx)
        .await?;
        Ok(balance)
    }

    async fn replay(
        &self,
        existing: CreditTransaction,
        kind: &str,
    ) -> BillingResult<AppliedTransaction> {
        let balance = self
            .get_balance(existing.subject_id, &existing.provider)
            .await?;
        tracing::info!(
            subject_id = %existing.subject_id,
            provider = %existing.provider,
            transaction_id = %existing.id,
            "Idempotent {kind} replay, no balance change"
        );
        Ok(AppliedTransaction {
            balance,
            transaction: existing,
            replayed: true,
        })
    }
}

fn validate_provider(provider: &str) -> BillingResult<()> {
    if provider.trim().is_empty() {
        return Err(BillingError::Validation(
            "provider tag must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn validate_positive(amount: Decimal) -> BillingResult<()> {
    if amount <= Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lazy pool: validation failures return before any connection attempt.
    fn ledger() -> CreditLedger {
        let pool = PgPool::connect_lazy("postgres://localhost/semo_unit").unwrap();
        CreditLedger::new(pool)
    }

    #[test]
    fn transaction_type_round_trips() {
        for ty in [
            TransactionType::Allocation,
            TransactionType::Usage,
            TransactionType::Refund,
            TransactionType::Adjustment,
            TransactionType::SubscriptionCancellation,
        ] {
            assert_eq!(TransactionType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TransactionType::parse("chargeback"), None);
    }

    #[tokio::test]
    async fn allocate_rejects_non_positive_amount() {
        let err = ledger()
            .allocate(Uuid::new_v4(), "stripe", Decimal::ZERO, "grant", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = ledger()
            .allocate(Uuid::new_v4(), "stripe", Decimal::new(-5, 0), "grant", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn use_credits_rejects_non_positive_amount() {
        let err = ledger()
            .use_credits(
                Uuid::new_v4(),
                "stripe",
                Decimal::new(-30, 0),
                "usage",
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn blank_provider_is_rejected() {
        let err = ledger()
            .allocate(Uuid::new_v4(), "  ", Decimal::ONE, "grant", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn adjust_rejects_zero_amount() {
        let err = ledger()
            .adjust(Uuid::new_v4(), "stripe", Decimal::ZERO, "correction")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn refund_requires_reference() {
        let err = ledger()
            .refund_allocation(Uuid::new_v4(), "stripe", "", "refund")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn history_rejects_bad_pagination() {
        let err = ledger()
            .transaction_history(Uuid::new_v4(), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = ledger()
            .transaction_history(Uuid::new_v4(), 10, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
