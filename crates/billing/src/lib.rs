// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Ledger operations take full parameter sets
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Semo Billing Module
//!
//! The credit ledger and webhook reconciliation engine: turns
//! asynchronous, at-least-once, possibly-duplicated provider notifications
//! into exactly-once, auditable balance mutations.
//!
//! ## Features
//!
//! - **Credit Ledger**: immutable transaction log plus per-(subject,
//!   provider) balance cache; allocation, usage, refund, adjustment
//! - **Webhook Event Store**: durable dedup of provider deliveries with
//!   persisted exponential-backoff retry state
//! - **Provider Normalizer**: per-PSP signature verification and mapping
//!   onto one canonical status vocabulary
//! - **Subscription Reconciler**: cancellation drives the funding balance
//!   to exactly zero, idempotently
//! - **Audit Events**: append-only trail of every balance mutation
//! - **Invariants**: runnable read-only consistency checks

pub mod customers;
pub mod error;
pub mod event_store;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod plans;
pub mod processor;
pub mod providers;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Customers
pub use customers::{CustomerMapping, CustomerMappingStore};

// Error
pub use error::{BillingError, BillingResult};

// Event store
pub use event_store::{retry_delay, ProcessingStatus, StoredWebhookEvent, WebhookEventStore};

// Events (audit)
pub use events::{BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    AppliedTransaction, CreditBalance, CreditLedger, CreditTransaction, TransactionType,
};

// Plans
pub use plans::{PaymentPlan, PlanCatalog};

// Processor
pub use processor::{Ingestion, ProcessOutcome, SweepSummary, WebhookProcessor};

// Providers
pub use providers::{
    CanonicalStatus, NormalizedEvent, ProviderAdapter, ProviderRegistry, StripeAdapter,
    StripeConfig, TossAdapter, TossConfig,
};

// Subscriptions
pub use subscriptions::{Cancellation, Subscription, SubscriptionService, SubscriptionStatus};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality.
pub struct BillingService {
    pub ledger: CreditLedger,
    pub event_store: WebhookEventStore,
    pub customers: CustomerMappingStore,
    pub plans: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub processor: WebhookProcessor,
    pub invariants: InvariantChecker,
    pub events: BillingEventLogger,
}

impl BillingService {
    /// Create a billing service with provider adapters configured from the
    /// environment. A provider without a secret is left unregistered and
    /// its webhooks are rejected at the boundary.
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(pool, ProviderRegistry::from_env())
    }

    /// Create a billing service with an explicit provider registry.
    pub fn new(pool: PgPool, registry: ProviderRegistry) -> Self {
        Self {
            ledger: CreditLedger::new(pool.clone()),
            event_store: WebhookEventStore::new(pool.clone()),
            customers: CustomerMappingStore::new(pool.clone()),
            plans: PlanCatalog::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            processor: WebhookProcessor::new(pool.clone(), registry),
            invariants: InvariantChecker::new(pool.clone()),
            events: BillingEventLogger::new(pool),
        }
    }
}
