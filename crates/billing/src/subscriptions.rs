//! Subscription lifecycle reconciliation.
//!
//! Credits are subscription-scoped, not perpetual: when the funding
//! subscription is canceled the subject's balance for that provider is
//! driven to exactly zero, in the same database transaction that flips the
//! subscription inactive. Re-processing the same cancellation (or a
//! redelivered one) finds a zero balance and records nothing.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::ledger::{CreditTransaction, TransactionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub provider: String,
    pub provider_subscription_id: String,
    pub status: String,
    pub plan_ref: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, subject_id, provider, provider_subscription_id, status, \
     plan_ref, current_period_end, canceled_at, created_at, updated_at";

/// Result of a cancellation pass. `zeroed_amount` is how much balance was
/// reset; zero with no transaction means the call was an idempotent no-op.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Cancellation {
    pub zeroed_amount: Decimal,
    pub reset_transaction: Option<CreditTransaction>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self { pool, event_logger }
    }

    /// Webhook-driven state sync.
    ///
    /// Upserts never flip an inactive subscription back to active: a
    /// redelivered (or out-of-order) payment event must not resurrect a
    /// subscription that was canceled in the meantime.
    pub async fn upsert_from_event(
        &self,
        subject_id: Uuid,
        provider: &str,
        provider_subscription_id: &str,
        plan_ref: Option<&str>,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Subscription> {
        if provider_subscription_id.is_empty() {
            return Err(BillingError::Validation(
                "provider subscription id must not be empty".to_string(),
            ));
        }

        let row: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (subject_id, provider, provider_subscription_id, status, plan_ref, current_period_end)
            VALUES ($1, $2, $3, 'active', $4, $5)
            ON CONFLICT (provider, provider_subscription_id) DO UPDATE SET
                plan_ref = COALESCE(EXCLUDED.plan_ref, subscriptions.plan_ref),
                current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(provider)
        .bind(provider_subscription_id)
        .bind(plan_ref)
        .bind(current_period_end)
        .fetch_one(&self.pool)
        .await?;

        self.event_logger
            .log(
                BillingEventType::SubscriptionUpserted,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "provider_subscription_id": provider_subscription_id,
                    "plan_ref": plan_ref,
                }),
            )
            .await;

        Ok(row)
    }

    pub async fn find(
        &self,
        provider: &str,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE provider = $1 AND provider_subscription_id = $2
            "#
        ))
        .bind(provider)
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Cancel the subscription and reset the subject's balance to zero.
    ///
    /// One transaction end to end: the subscription flips inactive, the
    /// balance row is locked, and a positive balance is consumed by a
    /// single `subscription_cancellation` entry of −balance with
    /// balance_after = 0. A zero or absent balance makes the whole call a
    /// no-op, which is what makes redelivered cancellations safe.
    pub async fn cancel(
        &self,
        subject_id: Uuid,
        provider: &str,
        provider_subscription_id: &str,
    ) -> BillingResult<Cancellation> {
        if provider.trim().is_empty() {
            return Err(BillingError::Validation(
                "provider tag must not be blank".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        // The subscription row may be missing when the creation event was
        // never observed; the balance reset still applies.
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'inactive',
                canceled_at = COALESCE(canceled_at, NOW()),
                updated_at = NOW()
            WHERE provider = $1 AND provider_subscription_id = $2
            "#,
        )
        .bind(provider)
        .bind(provider_subscription_id)
        .execute(&mut *tx)
        .await?;

        let balance: Option<Decimal> = sqlx::query_scalar(
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

        let balance = balance.unwrap_or(Decimal::ZERO);
        if balance <= Decimal::ZERO {
            tx.commit().await?;
            tracing::info!(
                subject_id = %subject_id,
                provider = provider,
                provider_subscription_id = provider_subscription_id,
                "Subscription cancellation observed, balance already zero"
            );
            return Ok(Cancellation {
                zeroed_amount: Decimal::ZERO,
                reset_transaction: None,
            });
        }

        let transaction: CreditTransaction = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (subject_id, provider, transaction_type, amount, balance_after, description)
            VALUES ($1, $2, $3, $4, 0, $5)
            RETURNING id, subject_id, provider, transaction_type, amount, balance_after,
                      description, feature, reference_id, idempotency_key, created_at
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .bind(TransactionType::SubscriptionCancellation.as_str())
        .bind(-balance)
        .bind(format!(
            "Balance reset on cancellation of {provider_subscription_id}"
        ))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE credit_balances
            SET current_balance = 0, last_transaction_at = NOW(), updated_at = NOW()
            WHERE subject_id = $1 AND provider = $2
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subject_id = %subject_id,
            provider = provider,
            provider_subscription_id = provider_subscription_id,
            zeroed = %balance,
            "Subscription canceled, balance reset to zero"
        );
        self.event_logger
            .log(
                BillingEventType::CancellationBalanceReset,
                Some(subject_id),
                Some(provider),
                serde_json::json!({
                    "provider_subscription_id": provider_subscription_id,
                    "zeroed_amount": balance,
                }),
            )
            .await;

        Ok(Cancellation {
            zeroed_amount: balance,
            reset_transaction: Some(transaction),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_status_round_trips() {
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Inactive] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("past_due"), None);
    }

    #[tokio::test]
    async fn cancel_rejects_blank_provider() {
        let pool = PgPool::connect_lazy("postgres://localhost/semo_unit").unwrap();
        let service = SubscriptionService::new(pool);
        let err = service
            .cancel(Uuid::new_v4(), " ", "sub_1")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn upsert_rejects_empty_subscription_id() {
        let pool = PgPool::connect_lazy("postgres://localhost/semo_unit").unwrap();
        let service = SubscriptionService::new(pool);
        let err = service
            .upsert_from_event(Uuid::new_v4(), "stripe", "", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
