//! Toss Payments webhook adapter.
//!
//! Signature scheme: a single `Toss-Signature` header carrying the
//! base64-encoded HMAC-SHA256 of the raw body under the webhook secret.
//! Toss deliveries carry no provider event id, so the dedup key is derived
//! deterministically from the payload (event type, payment key, status):
//! a redelivery of the same transition collapses onto the same key while a
//! later status change of the same payment stays distinct.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use semo_shared::PaymentProvider;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::providers::{first_subject_id, CanonicalStatus, NormalizedEvent, ProviderAdapter};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct TossConfig {
    pub webhook_secret: String,
}

impl TossConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("TOSS_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("TOSS_WEBHOOK_SECRET not set".to_string()))?;
        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "TOSS_WEBHOOK_SECRET is empty".to_string(),
            ));
        }
        Ok(Self { webhook_secret })
    }
}

pub struct TossAdapter {
    config: TossConfig,
}

impl TossAdapter {
    pub fn new(config: TossConfig) -> Self {
        Self { config }
    }
}

/// Map a Toss event type and payment status onto the canonical set.
///
/// `CANCELED`/`PARTIAL_CANCELED` are refunds in Toss vocabulary: money
/// going back to the payer, not a subscription ending. The subscription
/// ending is `BILLING_DELETED` (billing key revoked).
fn map_status(event_type: &str, payment_status: Option<&str>) -> Option<CanonicalStatus> {
    match event_type {
        "BILLING_DELETED" => Some(CanonicalStatus::Canceled),
        "PAYMENT_STATUS_CHANGED" => match payment_status? {
            "DONE" => Some(CanonicalStatus::Completed),
            "CANCELED" | "PARTIAL_CANCELED" => Some(CanonicalStatus::Refunded),
            "ABORTED" | "EXPIRED" => Some(CanonicalStatus::Failed),
            // READY / IN_PROGRESS / WAITING_FOR_DEPOSIT are intermediate.
            _ => None,
        },
        _ => None,
    }
}

impl ProviderAdapter for TossAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Toss
    }

    fn verify(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        if signature.is_empty() {
            return Err(BillingError::ProviderVerification(
                "missing toss signature header".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes())
            .map_err(|_| {
                BillingError::ProviderVerification("invalid webhook secret key".to_string())
            })?;
        mac.update(payload);
        let computed = BASE64.encode(mac.finalize().into_bytes());

        if computed != signature {
            return Err(BillingError::ProviderVerification(
                "signature mismatch".to_string(),
            ));
        }
        Ok(())
    }

    fn normalize(
        &self,
        raw: &serde_json::Value,
        received_at: OffsetDateTime,
    ) -> BillingResult<NormalizedEvent> {
        let event_type = raw["eventType"]
            .as_str()
            .ok_or_else(|| {
                BillingError::ProviderVerification("toss event missing eventType".to_string())
            })?
            .to_string();
        let data = &raw["data"];

        let payment_key = data["paymentKey"]
            .as_str()
            .or_else(|| data["billingKey"].as_str());
        let payment_status = data["status"].as_str();

        let event_id = match raw["eventId"].as_str().filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let key = payment_key.ok_or_else(|| {
                    BillingError::ProviderVerification(
                        "toss event missing paymentKey/billingKey".to_string(),
                    )
                })?;
                format!("toss:{event_type}:{key}:{}", payment_status.unwrap_or("-"))
            }
        };

        // Correlation fallback chain, fixed order, first hit wins:
        //   1. data.metadata.subject_id
        //   2. data.customerKey (merchants commonly key customers by the
        //      internal subject id)
        // Step 3 (customer mapping by customerKey) happens in the processor.
        let subject_id = first_subject_id(&[
            data["metadata"]["subject_id"].as_str(),
            data["customerKey"].as_str(),
        ]);

        Ok(NormalizedEvent {
            provider: PaymentProvider::Toss,
            event_id,
            event_type: event_type.clone(),
            status: map_status(&event_type, payment_status),
            subject_id,
            provider_customer_id: data["customerKey"].as_str().map(str::to_string),
            customer_email: data["customerEmail"].as_str().map(str::to_string),
            provider_payment_ref: data["orderId"]
                .as_str()
                .or(payment_key)
                .map(str::to_string),
            provider_txn_ref: payment_key.map(str::to_string),
            plan_ref: data["metadata"]["plan_id"]
                .as_str()
                .or_else(|| data["metadata"]["price_id"].as_str())
                .map(str::to_string),
            subscription_ref: data["billingKey"].as_str().map(str::to_string),
            current_period_end: None,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> TossAdapter {
        TossAdapter::new(TossConfig {
            webhook_secret: "toss_test_secret".to_string(),
        })
    }

    fn sign(payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(b"toss_test_secret").unwrap();
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = br#"{"eventType":"PAYMENT_STATUS_CHANGED"}"#;
        adapter().verify(payload, &sign(payload)).unwrap();
    }

    #[test]
    fn rejects_wrong_signature() {
        let err = adapter()
            .verify(br#"{"eventType":"X"}"#, &sign(b"other"))
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    #[test]
    fn rejects_missing_signature() {
        let err = adapter().verify(b"{}", "").unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    #[test]
    fn maps_toss_statuses_to_canonical() {
        assert_eq!(
            map_status("PAYMENT_STATUS_CHANGED", Some("DONE")),
            Some(CanonicalStatus::Completed)
        );
        assert_eq!(
            map_status("PAYMENT_STATUS_CHANGED", Some("CANCELED")),
            Some(CanonicalStatus::Refunded)
        );
        assert_eq!(
            map_status("PAYMENT_STATUS_CHANGED", Some("PARTIAL_CANCELED")),
            Some(CanonicalStatus::Refunded)
        );
        assert_eq!(
            map_status("PAYMENT_STATUS_CHANGED", Some("ABORTED")),
            Some(CanonicalStatus::Failed)
        );
        assert_eq!(map_status("PAYMENT_STATUS_CHANGED", Some("READY")), None);
        assert_eq!(
            map_status("BILLING_DELETED", None),
            Some(CanonicalStatus::Canceled)
        );
        assert_eq!(map_status("DEPOSIT_CALLBACK", Some("DONE")), None);
    }

    #[test]
    fn derives_deterministic_event_id() {
        let raw = json!({
            "eventType": "PAYMENT_STATUS_CHANGED",
            "data": {"paymentKey": "pay_abc", "status": "DONE", "orderId": "ord_1"}
        });

        let first = adapter().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        let second = adapter().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(first.event_id, "toss:PAYMENT_STATUS_CHANGED:pay_abc:DONE");
    }

    #[test]
    fn customer_key_resolves_subject_when_uuid() {
        let subject = uuid::Uuid::new_v4();
        let raw = json!({
            "eventType": "PAYMENT_STATUS_CHANGED",
            "data": {
                "paymentKey": "pay_abc",
                "status": "DONE",
                "customerKey": subject.to_string()
            }
        });

        let event = adapter().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, Some(subject));
        assert_eq!(event.status, Some(CanonicalStatus::Completed));
    }

    #[test]
    fn opaque_customer_key_defers_to_mapping() {
        let raw = json!({
            "eventType": "PAYMENT_STATUS_CHANGED",
            "data": {"paymentKey": "pay_abc", "status": "DONE", "customerKey": "legacy-9912"}
        });

        let event = adapter().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, None);
        assert_eq!(event.provider_customer_id.as_deref(), Some("legacy-9912"));
    }
}
