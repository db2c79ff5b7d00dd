//! Stripe webhook adapter.
//!
//! Signature scheme: the `Stripe-Signature` header carries
//! `t=<unix>,v1=<hex hmac>`; the signed payload is `"{t}.{body}"` under
//! HMAC-SHA256 with the endpoint secret, and the timestamp must be within
//! a five-minute tolerance window.

use hmac::{Hmac, Mac};
use semo_shared::PaymentProvider;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::providers::{first_subject_id, CanonicalStatus, NormalizedEvent, ProviderAdapter};

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between Stripe's timestamp and ours, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeConfig {
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET is empty".to_string(),
            ));
        }
        Ok(Self { webhook_secret })
    }
}

pub struct StripeAdapter {
    config: StripeConfig,
}

impl StripeAdapter {
    pub fn new(config: StripeConfig) -> Self {
        Self { config }
    }

    fn verify_at(&self, payload: &[u8], signature: &str, now_unix: i64) -> BillingResult<()> {
        // Parse the signature header: t=timestamp,v1=signature
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            BillingError::ProviderVerification("missing timestamp in signature header".to_string())
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            BillingError::ProviderVerification("missing v1 signature in header".to_string())
        })?;

        if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(BillingError::ProviderVerification(format!(
                "signature timestamp outside tolerance ({}s)",
                (now_unix - timestamp).abs()
            )));
        }

        let payload_str = std::str::from_utf8(payload).map_err(|_| {
            BillingError::ProviderVerification("payload is not valid utf-8".to_string())
        })?;

        // The secret's "whsec_" prefix is part of the key material Stripe
        // hands out; strip it before keying the MAC.
        let secret_key = self
            .config
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.config.webhook_secret);
        let signed_payload = format!("{timestamp}.{payload_str}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            BillingError::ProviderVerification("invalid webhook secret key".to_string())
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            return Err(BillingError::ProviderVerification(
                "signature mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Map a Stripe event type onto the canonical status set. Types outside
/// the vocabulary return `None` and are acknowledged without dispatch.
fn map_event_type(event_type: &str) -> Option<CanonicalStatus> {
    match event_type {
        "checkout.session.completed" | "invoice.paid" | "invoice.payment_succeeded" => {
            Some(CanonicalStatus::Completed)
        }
        "customer.subscription.deleted" => Some(CanonicalStatus::Canceled),
        "charge.refunded" => Some(CanonicalStatus::Refunded),
        "invoice.payment_failed" | "charge.failed" => Some(CanonicalStatus::Failed),
        _ => None,
    }
}

impl ProviderAdapter for StripeAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn normalize(
        &self,
        raw: &serde_json::Value,
        received_at: OffsetDateTime,
    ) -> BillingResult<NormalizedEvent> {
        let event_id = raw["id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BillingError::ProviderVerification("stripe event missing id".to_string())
            })?
            .to_string();
        let event_type = raw["type"]
            .as_str()
            .ok_or_else(|| {
                BillingError::ProviderVerification("stripe event missing type".to_string())
            })?
            .to_string();
        let object = &raw["data"]["object"];

        // Correlation fallback chain, fixed order, first hit wins:
        //   1. object.metadata.subject_id
        //   2. object.subscription_details.metadata.subject_id
        //   3. first line item metadata.subject_id
        // Step 4 (customer mapping by `customer`) happens in the processor.
        let subject_id = first_subject_id(&[
            object["metadata"]["subject_id"].as_str(),
            object["subscription_details"]["metadata"]["subject_id"].as_str(),
            object["lines"]["data"][0]["metadata"]["subject_id"].as_str(),
        ]);

        let provider_customer_id = object["customer"].as_str().map(str::to_string);
        let customer_email = object["customer_email"]
            .as_str()
            .or_else(|| object["customer_details"]["email"].as_str())
            .map(str::to_string);

        // Invoice id anchors allocation idempotency; checkout sessions fall
        // back to their own id when no invoice is attached yet.
        let provider_payment_ref = object["invoice"]
            .as_str()
            .or_else(|| object["id"].as_str())
            .map(str::to_string);
        let provider_txn_ref = object["payment_intent"]
            .as_str()
            .or_else(|| object["charge"].as_str())
            .map(str::to_string);

        // Plan reference: price id before product id (pinned precedence).
        let first_line = &object["lines"]["data"][0];
        let plan_ref = first_line["price"]["id"]
            .as_str()
            .or_else(|| first_line["price"]["product"].as_str())
            .or_else(|| object["metadata"]["price_id"].as_str())
            .map(str::to_string);

        let subscription_ref = if event_type.starts_with("customer.subscription.") {
            object["id"].as_str().map(str::to_string)
        } else {
            object["subscription"].as_str().map(str::to_string)
        };

        let current_period_end = object["current_period_end"]
            .as_i64()
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        Ok(NormalizedEvent {
            provider: PaymentProvider::Stripe,
            event_id,
            event_type: event_type.clone(),
            status: map_event_type(&event_type),
            subject_id,
            provider_customer_id,
            customer_email,
            provider_payment_ref,
            provider_txn_ref,
            plan_ref,
            subscription_ref,
            current_period_end,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> StripeAdapter {
        StripeAdapter::new(StripeConfig {
            webhook_secret: "whsec_test_secret".to_string(),
        })
    }

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign(payload, 1_700_000_000);
        adapter()
            .verify_at(payload.as_bytes(), &header, 1_700_000_100)
            .unwrap();
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000);
        let err = adapter()
            .verify_at(br#"{"id":"evt_2"}"#, &header, 1_700_000_100)
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        let err = adapter()
            .verify_at(payload.as_bytes(), &header, 1_700_000_000 + 301)
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    #[test]
    fn rejects_malformed_header() {
        let err = adapter()
            .verify_at(b"{}", "v1=deadbeef", 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    #[test]
    fn maps_event_types_to_canonical_statuses() {
        assert_eq!(map_event_type("invoice.paid"), Some(CanonicalStatus::Completed));
        assert_eq!(
            map_event_type("checkout.session.completed"),
            Some(CanonicalStatus::Completed)
        );
        assert_eq!(
            map_event_type("customer.subscription.deleted"),
            Some(CanonicalStatus::Canceled)
        );
        assert_eq!(map_event_type("charge.refunded"), Some(CanonicalStatus::Refunded));
        assert_eq!(
            map_event_type("invoice.payment_failed"),
            Some(CanonicalStatus::Failed)
        );
        assert_eq!(map_event_type("customer.subscription.updated"), None);
        assert_eq!(map_event_type("payout.created"), None);
    }

    #[test]
    fn normalizes_invoice_paid() {
        let subject = uuid::Uuid::new_v4();
        let raw = json!({
            "id": "evt_123",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_456",
                "customer": "cus_789",
                "customer_email": "jo@example.com",
                "subscription": "sub_1",
                "metadata": {"subject_id": subject.to_string()},
                "lines": {"data": [{"price": {"id": "price_basic", "product": "prod_basic"}}]}
            }}
        });

        let event = adapter()
            .normalize(&raw, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(event.event_id, "evt_123");
        assert_eq!(event.status, Some(CanonicalStatus::Completed));
        assert_eq!(event.subject_id, Some(subject));
        assert_eq!(event.provider_customer_id.as_deref(), Some("cus_789"));
        assert_eq!(event.provider_payment_ref.as_deref(), Some("in_456"));
        assert_eq!(event.plan_ref.as_deref(), Some("price_basic"));
        assert_eq!(event.subscription_ref.as_deref(), Some("sub_1"));
    }

    #[test]
    fn subject_falls_back_to_line_item_metadata() {
        let subject = uuid::Uuid::new_v4();
        let raw = json!({
            "id": "evt_124",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_457",
                "lines": {"data": [{"metadata": {"subject_id": subject.to_string()}}]}
            }}
        });

        let event = adapter()
            .normalize(&raw, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(event.subject_id, Some(subject));
    }

    #[test]
    fn direct_metadata_wins_over_line_items() {
        let direct = uuid::Uuid::new_v4();
        let nested = uuid::Uuid::new_v4();
        let raw = json!({
            "id": "evt_125",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_458",
                "metadata": {"subject_id": direct.to_string()},
                "lines": {"data": [{"metadata": {"subject_id": nested.to_string()}}]}
            }}
        });

        let event = adapter()
            .normalize(&raw, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(event.subject_id, Some(direct));
    }

    #[test]
    fn subscription_deleted_carries_subscription_ref() {
        let raw = json!({
            "id": "evt_126",
            "type": "customer.subscription.deleted",
            "data": {"object": {
                "id": "sub_9",
                "customer": "cus_789",
                "current_period_end": 1_700_000_000
            }}
        });

        let event = adapter()
            .normalize(&raw, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(event.status, Some(CanonicalStatus::Canceled));
        assert_eq!(event.subscription_ref.as_deref(), Some("sub_9"));
        assert!(event.current_period_end.is_some());
    }

    #[test]
    fn missing_event_id_is_rejected() {
        let err = adapter()
            .normalize(&json!({"type": "invoice.paid"}), OffsetDateTime::UNIX_EPOCH)
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }
}
