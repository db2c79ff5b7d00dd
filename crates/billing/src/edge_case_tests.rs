// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Tests critical boundary conditions in:
//! - Retry backoff (LED-B01 to LED-B05)
//! - Provider signature verification (LED-V01 to LED-V07)
//! - Canonical status mapping (LED-N01 to LED-N06)
//! - Correlation fallback chain (LED-C01 to LED-C05)
//! - Ledger input validation (LED-L01 to LED-L05)

#[cfg(test)]
mod backoff_tests {
    use crate::event_store::retry_delay;

    // =========================================================================
    // LED-B01: First failure schedules +5 minutes
    // =========================================================================
    #[test]
    fn test_first_failure_five_minutes() {
        assert_eq!(retry_delay(0), time::Duration::minutes(5));
    }

    // =========================================================================
    // LED-B02: Deltas double: 5, 10, 20, 40
    // =========================================================================
    #[test]
    fn test_deltas_double() {
        assert_eq!(retry_delay(1), time::Duration::minutes(10));
        assert_eq!(retry_delay(2), time::Duration::minutes(20));
        assert_eq!(retry_delay(3), time::Duration::minutes(40));
    }

    // =========================================================================
    // LED-B03: Backoff is monotonic up to the cap
    // =========================================================================
    #[test]
    fn test_monotonic_until_cap() {
        let mut previous = time::Duration::ZERO;
        for count in 0..12 {
            let delay = retry_delay(count);
            assert!(delay >= previous, "delay shrank at retry_count {count}");
            previous = delay;
        }
    }

    // =========================================================================
    // LED-B04: Cap at 1440 minutes (24 hours)
    // =========================================================================
    #[test]
    fn test_cap_at_24_hours() {
        // 5 * 2^9 = 2560 would exceed the cap
        assert_eq!(retry_delay(9), time::Duration::minutes(1440));
        assert_eq!(retry_delay(30), time::Duration::minutes(1440));
        assert_eq!(retry_delay(i32::MAX), time::Duration::minutes(1440));
    }

    // =========================================================================
    // LED-B05: Exact expected sequence from the first eight failures
    // =========================================================================
    #[test]
    fn test_expected_sequence() {
        let minutes: Vec<i64> = (0..8).map(|n| retry_delay(n).whole_minutes()).collect();
        assert_eq!(minutes, vec![5, 10, 20, 40, 80, 160, 320, 640]);
    }
}

#[cfg(test)]
mod signature_tests {
    use crate::error::BillingError;
    use crate::providers::{ProviderAdapter, TossAdapter, TossConfig};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn toss_adapter(secret: &str) -> TossAdapter {
        TossAdapter::new(TossConfig {
            webhook_secret: secret.to_string(),
        })
    }

    fn toss_sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // LED-V01: Valid Toss signature over the exact body is accepted
    // =========================================================================
    #[test]
    fn test_toss_valid_signature_accepted() {
        let payload = br#"{"eventType":"PAYMENT_STATUS_CHANGED","data":{"status":"DONE"}}"#;
        let adapter = toss_adapter("s3cret");
        adapter.verify(payload, &toss_sign("s3cret", payload)).unwrap();
    }

    // =========================================================================
    // LED-V02: One flipped byte in the body fails verification
    // =========================================================================
    #[test]
    fn test_toss_tampered_body_rejected() {
        let payload = br#"{"amount":100}"#;
        let tampered = br#"{"amount":900}"#;
        let adapter = toss_adapter("s3cret");
        let err = adapter
            .verify(tampered, &toss_sign("s3cret", payload))
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    // =========================================================================
    // LED-V03: Signature from a different secret fails
    // =========================================================================
    #[test]
    fn test_toss_wrong_secret_rejected() {
        let payload = br#"{"amount":100}"#;
        let adapter = toss_adapter("s3cret");
        let err = adapter
            .verify(payload, &toss_sign("other", payload))
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderVerification(_)));
    }

    // =========================================================================
    // LED-V04: Verification failures are terminal, never retryable
    // =========================================================================
    #[test]
    fn test_verification_failure_not_retryable() {
        let err = BillingError::ProviderVerification("signature mismatch".to_string());
        assert!(!err.is_retryable());
    }
}

#[cfg(test)]
mod canonical_mapping_tests {
    use crate::providers::{CanonicalStatus, ProviderAdapter, StripeAdapter, StripeConfig};
    use serde_json::json;
    use time::OffsetDateTime;

    fn stripe() -> StripeAdapter {
        StripeAdapter::new(StripeConfig {
            webhook_secret: "whsec_x".to_string(),
        })
    }

    fn normalize(event_type: &str) -> Option<CanonicalStatus> {
        let raw = json!({
            "id": "evt_map",
            "type": event_type,
            "data": {"object": {"id": "obj_1"}}
        });
        stripe()
            .normalize(&raw, OffsetDateTime::UNIX_EPOCH)
            .unwrap()
            .status
    }

    // =========================================================================
    // LED-N01: Payment success events map to completed
    // =========================================================================
    #[test]
    fn test_success_events_map_to_completed() {
        assert_eq!(normalize("invoice.paid"), Some(CanonicalStatus::Completed));
        assert_eq!(
            normalize("invoice.payment_succeeded"),
            Some(CanonicalStatus::Completed)
        );
        assert_eq!(
            normalize("checkout.session.completed"),
            Some(CanonicalStatus::Completed)
        );
    }

    // =========================================================================
    // LED-N02: Subscription deletion maps to canceled
    // =========================================================================
    #[test]
    fn test_subscription_deleted_maps_to_canceled() {
        assert_eq!(
            normalize("customer.subscription.deleted"),
            Some(CanonicalStatus::Canceled)
        );
    }

    // =========================================================================
    // LED-N03: Refund and failure events map onto their statuses
    // =========================================================================
    #[test]
    fn test_refund_and_failure_mappings() {
        assert_eq!(normalize("charge.refunded"), Some(CanonicalStatus::Refunded));
        assert_eq!(
            normalize("invoice.payment_failed"),
            Some(CanonicalStatus::Failed)
        );
    }

    // =========================================================================
    // LED-N04: Everything else is non-actionable, not an error
    // =========================================================================
    #[test]
    fn test_unknown_event_types_are_non_actionable() {
        assert_eq!(normalize("customer.subscription.updated"), None);
        assert_eq!(normalize("payment_method.attached"), None);
        assert_eq!(normalize("payout.paid"), None);
    }

    // =========================================================================
    // LED-N05: Canonical set is closed: exactly four parsed values
    // =========================================================================
    #[test]
    fn test_canonical_set_is_closed() {
        let all = ["completed", "canceled", "refunded", "failed"];
        for tag in all {
            assert!(CanonicalStatus::parse(tag).is_some(), "{tag} must parse");
        }
        for tag in ["pending", "processing", "DONE", "Completed"] {
            assert!(CanonicalStatus::parse(tag).is_none(), "{tag} must not parse");
        }
    }
}

#[cfg(test)]
mod correlation_tests {
    use crate::providers::{ProviderAdapter, StripeAdapter, StripeConfig};
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn stripe() -> StripeAdapter {
        StripeAdapter::new(StripeConfig {
            webhook_secret: "whsec_x".to_string(),
        })
    }

    // =========================================================================
    // LED-C01: Direct object metadata beats every nested source
    // =========================================================================
    #[test]
    fn test_direct_metadata_wins() {
        let direct = Uuid::new_v4();
        let nested = Uuid::new_v4();
        let line = Uuid::new_v4();
        let raw = json!({
            "id": "evt_c1",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_1",
                "metadata": {"subject_id": direct.to_string()},
                "subscription_details": {"metadata": {"subject_id": nested.to_string()}},
                "lines": {"data": [{"metadata": {"subject_id": line.to_string()}}]}
            }}
        });
        let event = stripe().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, Some(direct));
    }

    // =========================================================================
    // LED-C02: Subscription-details metadata is the second rung
    // =========================================================================
    #[test]
    fn test_subscription_details_is_second() {
        let nested = Uuid::new_v4();
        let line = Uuid::new_v4();
        let raw = json!({
            "id": "evt_c2",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_2",
                "subscription_details": {"metadata": {"subject_id": nested.to_string()}},
                "lines": {"data": [{"metadata": {"subject_id": line.to_string()}}]}
            }}
        });
        let event = stripe().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, Some(nested));
    }

    // =========================================================================
    // LED-C03: First line item is the third rung
    // =========================================================================
    #[test]
    fn test_line_item_is_third() {
        let line = Uuid::new_v4();
        let raw = json!({
            "id": "evt_c3",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_3",
                "lines": {"data": [{"metadata": {"subject_id": line.to_string()}}]}
            }}
        });
        let event = stripe().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, Some(line));
    }

    // =========================================================================
    // LED-C04: A garbage uuid on a higher rung does not shadow a valid one
    // =========================================================================
    #[test]
    fn test_invalid_uuid_falls_through() {
        let line = Uuid::new_v4();
        let raw = json!({
            "id": "evt_c4",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_4",
                "metadata": {"subject_id": "not-a-uuid"},
                "lines": {"data": [{"metadata": {"subject_id": line.to_string()}}]}
            }}
        });
        let event = stripe().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, Some(line));
    }

    // =========================================================================
    // LED-C05: Total payload miss leaves resolution to the customer mapping
    // =========================================================================
    #[test]
    fn test_total_miss_defers_to_mapping() {
        let raw = json!({
            "id": "evt_c5",
            "type": "invoice.paid",
            "data": {"object": {"id": "in_5", "customer": "cus_55"}}
        });
        let event = stripe().normalize(&raw, OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(event.subject_id, None);
        assert_eq!(event.provider_customer_id.as_deref(), Some("cus_55"));
    }
}

#[cfg(test)]
mod ledger_validation_tests {
    use crate::error::BillingError;
    use crate::ledger::CreditLedger;
    use rust_decimal::Decimal;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn ledger() -> CreditLedger {
        // Lazy pool: validation happens before any connection attempt.
        let pool = PgPool::connect_lazy("postgres://localhost/semo_unit").unwrap();
        CreditLedger::new(pool)
    }

    // =========================================================================
    // LED-L01: Zero-amount allocation is a validation error
    // =========================================================================
    #[tokio::test]
    async fn test_zero_allocation_rejected() {
        let err = ledger()
            .allocate(Uuid::new_v4(), "stripe", Decimal::ZERO, "grant", Some("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // LED-L02: Negative usage amount is a validation error
    // =========================================================================
    #[tokio::test]
    async fn test_negative_usage_rejected() {
        let err = ledger()
            .use_credits(
                Uuid::new_v4(),
                "stripe",
                Decimal::new(-1, 0),
                "usage",
                Some("search"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // LED-L03: Insufficient balance reports the exact shortfall
    // =========================================================================
    #[test]
    fn test_insufficient_balance_carries_amounts() {
        let err = BillingError::InsufficientBalance {
            requested: Decimal::new(100, 0),
            available: Decimal::new(70, 0),
        };
        match err {
            BillingError::InsufficientBalance {
                requested,
                available,
            } => {
                assert_eq!(requested, Decimal::new(100, 0));
                assert_eq!(available, Decimal::new(70, 0));
            }
            _ => panic!("wrong variant"),
        }
    }

    // =========================================================================
    // LED-L04: Business failures are retryable, input failures are not
    // =========================================================================
    #[test]
    fn test_retryability_split() {
        assert!(BillingError::NotFound("mapping".into()).is_retryable());
        assert!(BillingError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!BillingError::Validation("bad amount".into()).is_retryable());
        assert!(!BillingError::ProviderVerification("bad sig".into()).is_retryable());
    }

    // =========================================================================
    // LED-L05: Fixed-point amounts survive round trips without float drift
    // =========================================================================
    #[test]
    fn test_decimal_no_float_drift() {
        let amount: Decimal = "0.1".parse().unwrap();
        let mut total = Decimal::ZERO;
        for _ in 0..10 {
            total += amount;
        }
        assert_eq!(total, Decimal::ONE);
    }
}
