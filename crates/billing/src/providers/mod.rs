//! Provider event normalizer.
//!
//! Each PSP defines its own payload shape and status vocabulary; everything
//! downstream of this module speaks one canonical model. Adapters verify
//! the delivery signature BEFORE any parsing (an unverifiable payload
//! never becomes a trusted event) and map provider statuses onto the fixed
//! canonical set, so adding a provider never touches ledger or
//! reconciliation logic.

pub mod stripe;
pub mod toss;

use std::collections::HashMap;
use std::sync::Arc;

use semo_shared::PaymentProvider;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

pub use stripe::{StripeAdapter, StripeConfig};
pub use toss::{TossAdapter, TossConfig};

/// Canonical outcome vocabulary. All internal dispatch switches on this
/// set, never on provider-specific strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Completed,
    Canceled,
    Refunded,
    Failed,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Canceled => "canceled",
            CanonicalStatus::Refunded => "refunded",
            CanonicalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(CanonicalStatus::Completed),
            "canceled" => Some(CanonicalStatus::Canceled),
            "refunded" => Some(CanonicalStatus::Refunded),
            "failed" => Some(CanonicalStatus::Failed),
            _ => None,
        }
    }
}

/// One provider notification in canonical form.
///
/// `status` is `None` for event types outside the canonical vocabulary:
/// those are acknowledged and recorded but drive no ledger mutation.
/// `subject_id` is the correlation resolved from the payload itself (chain
/// steps 1-3); when it is absent the processor falls back to the customer
/// mapping via `provider_customer_id` (step 4).
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub status: Option<CanonicalStatus>,
    pub subject_id: Option<Uuid>,
    pub provider_customer_id: Option<String>,
    pub customer_email: Option<String>,
    /// Idempotency reference for the allocation (invoice id / order id).
    pub provider_payment_ref: Option<String>,
    /// Provider-side transaction handle (payment intent / payment key).
    pub provider_txn_ref: Option<String>,
    /// Price or product id used to resolve credits from the plan catalog.
    pub plan_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

/// A provider-specific webhook adapter.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    /// Verify the delivery signature against the raw payload bytes. Runs
    /// before any parsing; failure is terminal for the delivery.
    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()>;

    /// Map a verified payload into the canonical event model.
    fn normalize(
        &self,
        raw: &serde_json::Value,
        received_at: OffsetDateTime,
    ) -> BillingResult<NormalizedEvent>;
}

/// The set of configured adapters, keyed by provider.
#[derive(Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.provider(), a))
            .collect::<HashMap<_, _>>();
        Self { adapters }
    }

    /// Build the registry from environment configuration. A provider whose
    /// secret is missing is simply not registered; its webhooks will be
    /// rejected at the boundary.
    pub fn from_env() -> Self {
        let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

        match StripeConfig::from_env() {
            Ok(config) => adapters.push(Arc::new(StripeAdapter::new(config))),
            Err(e) => tracing::warn!(error = %e, "Stripe webhooks not configured"),
        }
        match TossConfig::from_env() {
            Ok(config) => adapters.push(Arc::new(TossAdapter::new(config))),
            Err(e) => tracing::warn!(error = %e, "Toss webhooks not configured"),
        }

        Self::new(adapters)
    }

    pub fn get(&self, provider: PaymentProvider) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// First candidate that parses as a UUID wins. Candidates must be supplied
/// in the documented fallback order; `None` entries are skipped.
pub(crate) fn first_subject_id(candidates: &[Option<&str>]) -> Option<Uuid> {
    candidates
        .iter()
        .flatten()
        .find_map(|s| Uuid::parse_str(s).ok())
}
