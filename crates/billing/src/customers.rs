//! Provider-customer ↔ subject mapping.
//!
//! Providers identify payers by their own customer ids; this table resolves
//! those back to internal subject ids. Rows are created lazily the first
//! time a payment-setup event arrives carrying both sides of the mapping,
//! and the Normalizer's last correlation fallback reads them.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct CustomerMapping {
    pub id: Uuid,
    pub provider: String,
    pub provider_customer_id: String,
    pub subject_id: Uuid,
    pub email: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const MAPPING_COLUMNS: &str =
    "id, provider, provider_customer_id, subject_id, email, created_at, updated_at";

#[derive(Clone)]
pub struct CustomerMappingStore {
    pool: PgPool,
}

impl CustomerMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_provider_customer_id(
        &self,
        provider: &str,
        provider_customer_id: &str,
    ) -> BillingResult<Option<CustomerMapping>> {
        let row: Option<CustomerMapping> = sqlx::query_as(&format!(
            r#"
            SELECT {MAPPING_COLUMNS}
            FROM customer_mappings
            WHERE provider = $1 AND provider_customer_id = $2
            "#
        ))
        .bind(provider)
        .bind(provider_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_subject(
        &self,
        provider: &str,
        subject_id: Uuid,
    ) -> BillingResult<Option<CustomerMapping>> {
        let row: Option<CustomerMapping> = sqlx::query_as(&format!(
            r#"
            SELECT {MAPPING_COLUMNS}
            FROM customer_mappings
            WHERE provider = $1 AND subject_id = $2
            "#
        ))
        .bind(provider)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Create the mapping, or refresh the subject/email on redelivery.
    /// Upsert semantics keep webhook replays harmless.
    pub async fn create(
        &self,
        provider: &str,
        provider_customer_id: &str,
        subject_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<CustomerMapping> {
        if provider_customer_id.is_empty() {
            return Err(BillingError::Validation(
                "provider customer id must not be empty".to_string(),
            ));
        }

        let row: CustomerMapping = sqlx::query_as(&format!(
            r#"
            INSERT INTO customer_mappings (provider, provider_customer_id, subject_id, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, provider_customer_id) DO UPDATE SET
                subject_id = EXCLUDED.subject_id,
                email = COALESCE(EXCLUDED.email, customer_mappings.email),
                updated_at = NOW()
            RETURNING {MAPPING_COLUMNS}
            "#
        ))
        .bind(provider)
        .bind(provider_customer_id)
        .bind(subject_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn update_email(
        &self,
        provider: &str,
        provider_customer_id: &str,
        email: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE customer_mappings
            SET email = $3, updated_at = NOW()
            WHERE provider = $1 AND provider_customer_id = $2
            "#,
        )
        .bind(provider)
        .bind(provider_customer_id)
        .bind(email)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "no customer mapping for {provider} customer {provider_customer_id}"
            )));
        }
        Ok(())
    }
}
