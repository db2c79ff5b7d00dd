//! Billing error taxonomy.
//!
//! Business-rule failures (insufficient balance, missing rows) are distinct
//! variants from persistence failures so callers can decide what is
//! retryable. Idempotent replays are NOT errors anywhere in this crate:
//! they are recognized outcomes carried on the success path.

use rust_decimal::Decimal;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Malformed input to an API operation (non-positive amount, blank
    /// provider tag, bad pagination bounds).
    #[error("validation error: {0}")]
    Validation(String),

    /// Business rule, not a bug: the subject asked for more credits than
    /// the balance holds. Carries the exact shortfall for the caller.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    /// A balance, subscription, or event row that was required is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Signature or payload verification failed at the provider boundary.
    /// Never persisted, never retried.
    #[error("provider verification failed: {0}")]
    ProviderVerification(String),

    /// Persistence/connectivity failure; retryable by the caller or the
    /// webhook retry state machine.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Missing or malformed environment configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether a webhook handler failure with this error should be recorded
    /// for scheduled retry. Verification and validation failures are final;
    /// everything else may clear up on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BillingError::Validation(_) | BillingError::ProviderVerification(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_reports_exact_shortfall() {
        let err = BillingError::InsufficientBalance {
            requested: Decimal::new(100, 0),
            available: Decimal::new(70, 0),
        };
        assert_eq!(
            err.to_string(),
            "insufficient balance: requested 100, available 70"
        );
    }

    #[test]
    fn verification_failures_are_not_retryable() {
        assert!(!BillingError::ProviderVerification("bad signature".into()).is_retryable());
        assert!(!BillingError::Validation("amount must be positive".into()).is_retryable());
        assert!(BillingError::NotFound("mapping".into()).is_retryable());
        assert!(BillingError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }
}
