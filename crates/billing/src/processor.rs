//! Webhook processing pipeline: verify → persist → dispatch → settle.
//!
//! Ingestion and processing are deliberately decoupled. `ingest` verifies
//! the delivery, stores it durably, and attempts processing inline; a
//! handler failure is recorded on the event row for scheduled retry while
//! the provider still receives an acknowledgment, so redelivery storms
//! never build up. Malformed or unverifiable payloads are rejected
//! synchronously and never persisted. The sweeper re-enters through
//! `process_pending`, driven purely by persisted retry state.

use semo_shared::PaymentProvider;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customers::CustomerMappingStore;
use crate::error::{BillingError, BillingResult};
use crate::event_store::{StoredWebhookEvent, WebhookEventStore};
use crate::events::{BillingEventLogger, BillingEventType};
use crate::ledger::CreditLedger;
use crate::plans::PlanCatalog;
use crate::providers::{CanonicalStatus, NormalizedEvent, ProviderRegistry};
use crate::subscriptions::SubscriptionService;

/// Outcome of accepting one delivery at the boundary. Both variants are
/// acknowledged to the provider; `Duplicate` marks the idempotent-replay
/// path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingestion {
    Accepted { event_id: String },
    Duplicate { event_id: String },
}

/// Outcome of one processing attempt for a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handled and marked completed.
    Processed,
    /// Handler failed; retryable failures are rescheduled, terminal ones
    /// are acknowledged and abandoned.
    Failed,
    /// Another worker holds the claim, or the event is already terminal.
    NotClaimed,
}

/// Counters for one sweep over due events.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    registry: ProviderRegistry,
    store: WebhookEventStore,
    ledger: CreditLedger,
    subscriptions: SubscriptionService,
    customers: CustomerMappingStore,
    plans: PlanCatalog,
    event_logger: BillingEventLogger,
}

impl WebhookProcessor {
    pub fn new(pool: PgPool, registry: ProviderRegistry) -> Self {
        Self {
            registry,
            store: WebhookEventStore::new(pool.clone()),
            ledger: CreditLedger::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            customers: CustomerMappingStore::new(pool.clone()),
            plans: PlanCatalog::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool),
        }
    }

    pub fn store(&self) -> &WebhookEventStore {
        &self.store
    }

    /// Accept one raw delivery from the HTTP boundary.
    ///
    /// Signature or parse failures surface as `ProviderVerification` for a
    /// synchronous client-error response; they never enter the retry
    /// cycle. Everything past `save_event` is acknowledged: a handler
    /// failure is recorded on the stored event and retried later.
    pub async fn ingest(
        &self,
        provider: PaymentProvider,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<Ingestion> {
        let adapter = self.registry.get(provider).ok_or_else(|| {
            BillingError::ProviderVerification(format!("no adapter configured for {provider}"))
        })?;

        adapter.verify(payload, signature)?;

        let raw: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            BillingError::ProviderVerification(format!("payload is not valid json: {e}"))
        })?;
        let event = adapter.normalize(&raw, OffsetDateTime::now_utc())?;

        let inserted = self
            .store
            .save_event(
                provider.as_str(),
                &event.event_id,
                &event.event_type,
                event.status.map(|s| s.as_str()),
                &raw,
            )
            .await?;

        if !inserted {
            return Ok(Ingestion::Duplicate {
                event_id: event.event_id,
            });
        }

        self.process_stored(&event.event_id).await?;

        Ok(Ingestion::Accepted {
            event_id: event.event_id,
        })
    }

    /// Claim and process one stored event.
    pub async fn process_stored(&self, event_id: &str) -> BillingResult<ProcessOutcome> {
        let Some(stored) = self.store.claim_for_processing(event_id).await? else {
            return Ok(ProcessOutcome::NotClaimed);
        };

        let result = self.dispatch(&stored).await;
        match result {
            Ok(()) => {
                self.store.mark_processed(&stored.event_id).await?;
                Ok(ProcessOutcome::Processed)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.store.mark_failed(&stored.event_id, &e.to_string()).await?;
                } else {
                    // A terminal error (bad input, catalog misconfiguration)
                    // will not improve on redelivery; retrying it forever
                    // would just churn the sweeper. Acknowledge and abandon.
                    tracing::error!(
                        event_id = %stored.event_id,
                        event_type = %stored.event_type,
                        provider = %stored.provider,
                        error = %e,
                        "Terminal handler error, event abandoned without retry"
                    );
                    self.store.mark_processed(&stored.event_id).await?;
                }
                self.event_logger
                    .log_for_webhook(
                        BillingEventType::WebhookFailed,
                        None,
                        Some(&stored.provider),
                        Some(&stored.event_id),
                        serde_json::json!({
                            "event_type": stored.event_type,
                            "error": e.to_string(),
                            "retryable": e.is_retryable(),
                        }),
                    )
                    .await;
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    /// Sweep over events that are owed a processing attempt. Entry point
    /// for the scheduled worker.
    pub async fn process_pending(&self, limit: i64) -> BillingResult<SweepSummary> {
        let due = self.store.pending_events(limit).await?;
        let mut summary = SweepSummary::default();

        for event in &due {
            match self.process_stored(&event.event_id).await {
                Ok(ProcessOutcome::Processed) => summary.processed += 1,
                Ok(ProcessOutcome::Failed) => summary.failed += 1,
                Ok(ProcessOutcome::NotClaimed) => summary.skipped += 1,
                Err(e) => {
                    // Store-level failure; leave the event for the next sweep.
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %e,
                        "Sweep could not update webhook event state"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.processed + summary.failed + summary.skipped > 0 {
            tracing::info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Webhook retry sweep complete"
            );
        }
        Ok(summary)
    }

    /// Re-normalize a stored payload and route on the canonical status.
    async fn dispatch(&self, stored: &StoredWebhookEvent) -> BillingResult<()> {
        let provider: PaymentProvider = stored
            .provider
            .parse()
            .map_err(|_| BillingError::NotFound(format!("unknown provider {}", stored.provider)))?;
        let adapter = self.registry.get(provider).ok_or_else(|| {
            BillingError::Config(format!("no adapter configured for {provider}"))
        })?;

        let event = adapter.normalize(&stored.payload, stored.received_at)?;

        match event.status {
            None => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    provider = %event.provider,
                    "Non-actionable provider event, acknowledged without dispatch"
                );
                self.event_logger
                    .log_for_webhook(
                        BillingEventType::WebhookIgnored,
                        event.subject_id,
                        Some(event.provider.as_str()),
                        Some(&event.event_id),
                        serde_json::json!({"event_type": event.event_type}),
                    )
                    .await;
                Ok(())
            }
            Some(CanonicalStatus::Completed) => self.apply_completed(&event).await,
            Some(CanonicalStatus::Canceled) => self.apply_canceled(&event).await,
            Some(CanonicalStatus::Refunded) => self.apply_refunded(&event).await,
            Some(CanonicalStatus::Failed) => {
                // Nothing to settle; the failed payment left no credits to
                // reverse. Recorded for the audit trail.
                tracing::warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    provider = %event.provider,
                    "Provider reported a failed payment"
                );
                self.event_logger
                    .log_for_webhook(
                        BillingEventType::WebhookFailed,
                        event.subject_id,
                        Some(event.provider.as_str()),
                        Some(&event.event_id),
                        serde_json::json!({
                            "event_type": event.event_type,
                            "provider_status": "failed",
                        }),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Successful payment: maintain the customer mapping, sync the
    /// subscription, and allocate plan credits idempotently.
    async fn apply_completed(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let provider = event.provider.as_str();
        let subject_id = self.resolve_subject(event).await?;

        // Lazy mapping creation: the first successful payment event that
        // carries both sides establishes the link for later fallbacks.
        if let Some(customer_id) = &event.provider_customer_id {
            self.customers
                .create(
                    provider,
                    customer_id,
                    subject_id,
                    event.customer_email.as_deref(),
                )
                .await?;
        }

        if let Some(subscription_ref) = &event.subscription_ref {
            self.subscriptions
                .upsert_from_event(
                    subject_id,
                    provider,
                    subscription_ref,
                    event.plan_ref.as_deref(),
                    event.current_period_end,
                )
                .await?;
        }

        let Some(plan_ref) = &event.plan_ref else {
            tracing::info!(
                event_id = %event.event_id,
                subject_id = %subject_id,
                "Completed payment carries no plan reference, no credits to allocate"
            );
            return Ok(());
        };

        // Plan rows are synchronized externally; an unknown plan is treated
        // as transient so the allocation lands once the catalog catches up.
        let Some(plan) = self
            .plans
            .get_by_price_or_product_id(provider, plan_ref)
            .await?
        else {
            return Err(BillingError::NotFound(format!(
                "no active plan for {provider} reference {plan_ref}"
            )));
        };

        let reference = event
            .provider_payment_ref
            .as_deref()
            .unwrap_or(&event.event_id);

        let allocation = self
            .ledger
            .allocate(
                subject_id,
                provider,
                plan.credits_per_cycle,
                &format!("{} credits for {}", plan.credits_per_cycle, plan.display_name),
                Some(reference),
            )
            .await?;

        if allocation.replayed {
            tracing::info!(
                event_id = %event.event_id,
                subject_id = %subject_id,
                reference = reference,
                "Allocation already applied for this payment reference"
            );
        }
        Ok(())
    }

    /// Subscription ended: flip it inactive and zero the funding balance.
    async fn apply_canceled(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let provider = event.provider.as_str();
        let Some(subscription_ref) = &event.subscription_ref else {
            tracing::warn!(
                event_id = %event.event_id,
                provider = provider,
                "Cancellation event without a subscription reference, nothing to reconcile"
            );
            return Ok(());
        };

        // Subject resolution for cancellations prefers our own subscription
        // record over payload hints: it is authoritative for who was funded.
        let subject_id = match self.subscriptions.find(provider, subscription_ref).await? {
            Some(subscription) => subscription.subject_id,
            None => self.resolve_subject(event).await?,
        };

        let cancellation = self
            .subscriptions
            .cancel(subject_id, provider, subscription_ref)
            .await?;

        self.event_logger
            .log_for_webhook(
                BillingEventType::SubscriptionCanceled,
                Some(subject_id),
                Some(provider),
                Some(&event.event_id),
                serde_json::json!({
                    "provider_subscription_id": subscription_ref,
                    "zeroed_amount": cancellation.zeroed_amount,
                }),
            )
            .await;
        Ok(())
    }

    /// Money returned to the payer: reverse the matching allocation.
    async fn apply_refunded(&self, event: &NormalizedEvent) -> BillingResult<()> {
        let provider = event.provider.as_str();
        let Some(payment_ref) = &event.provider_payment_ref else {
            tracing::warn!(
                event_id = %event.event_id,
                provider = provider,
                "Refund event without a payment reference, nothing to reverse"
            );
            return Ok(());
        };

        let subject_id = self.resolve_subject(event).await?;
        self.ledger
            .refund_allocation(
                subject_id,
                provider,
                payment_ref,
                &format!("Refund of {payment_ref}"),
            )
            .await?;
        Ok(())
    }

    /// Correlation fallback chain, final step: the payload-derived subject
    /// (chain steps 1-3, resolved by the adapter) wins; otherwise the
    /// customer mapping by provider customer id. A total miss is a
    /// retryable failure, since the mapping may exist by the next attempt,
    /// and under-crediting a late subject beats mis-crediting a wrong one.
    async fn resolve_subject(&self, event: &NormalizedEvent) -> BillingResult<Uuid> {
        if let Some(subject_id) = event.subject_id {
            return Ok(subject_id);
        }

        if let Some(customer_id) = &event.provider_customer_id {
            if let Some(mapping) = self
                .customers
                .get_by_provider_customer_id(event.provider.as_str(), customer_id)
                .await?
            {
                return Ok(mapping.subject_id);
            }
        }

        tracing::warn!(
            event_id = %event.event_id,
            provider = %event.provider,
            provider_customer_id = ?event.provider_customer_id,
            "Could not resolve subject for event, allocation skipped"
        );
        Err(BillingError::NotFound(format!(
            "unresolvable subject for event {}",
            event.event_id
        )))
    }
}
