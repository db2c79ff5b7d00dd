//! Append-only audit trail of billing actions.
//!
//! Every ledger mutation and webhook failure leaves a row here. Audit
//! writes never fail the business operation that produced them: insert
//! errors are logged and swallowed.

use sqlx::PgPool;
use uuid::Uuid;

/// Audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    CreditsAllocated,
    CreditsUsed,
    CreditsRefunded,
    BalanceAdjusted,
    SubscriptionUpserted,
    SubscriptionCanceled,
    CancellationBalanceReset,
    WebhookFailed,
    WebhookIgnored,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::CreditsAllocated => "credits_allocated",
            BillingEventType::CreditsUsed => "credits_used",
            BillingEventType::CreditsRefunded => "credits_refunded",
            BillingEventType::BalanceAdjusted => "balance_adjusted",
            BillingEventType::SubscriptionUpserted => "subscription_upserted",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::CancellationBalanceReset => "cancellation_balance_reset",
            BillingEventType::WebhookFailed => "webhook_failed",
            BillingEventType::WebhookIgnored => "webhook_ignored",
        }
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an audit event. Failures are logged, never propagated.
    pub async fn log(
        &self,
        event_type: BillingEventType,
        subject_id: Option<Uuid>,
        provider: Option<&str>,
        data: serde_json::Value,
    ) {
        self.log_for_webhook(event_type, subject_id, provider, None, data)
            .await;
    }

    /// Record an audit event correlated with a stored webhook event.
    pub async fn log_for_webhook(
        &self,
        event_type: BillingEventType,
        subject_id: Option<Uuid>,
        provider: Option<&str>,
        webhook_event_id: Option<&str>,
        data: serde_json::Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (subject_id, provider, event_type, data, webhook_event_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(subject_id)
        .bind(provider)
        .bind(event_type.as_str())
        .bind(&data)
        .bind(webhook_event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                event_type = event_type.as_str(),
                subject_id = ?subject_id,
                error = %e,
                "Failed to record billing audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tags_are_stable() {
        assert_eq!(
            BillingEventType::CreditsAllocated.as_str(),
            "credits_allocated"
        );
        assert_eq!(
            BillingEventType::CancellationBalanceReset.as_str(),
            "cancellation_balance_reset"
        );
        assert_eq!(BillingEventType::WebhookFailed.as_str(), "webhook_failed");
    }
}
