//! Read-only plan catalog lookups.
//!
//! Plan rows are synchronized from the provider catalogs by an external
//! process; this module only resolves how many credits a payment grants.
//! Lookup precedence is pinned: price id first, then product id, catalog
//! table only. Credit counts embedded in provider metadata are ignored.

use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::error::BillingResult;

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct PaymentPlan {
    pub provider: String,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub display_name: String,
    pub credits_per_cycle: Decimal,
    pub active: bool,
}

#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve an active plan by a provider price or product id. A price-id
    /// match wins over a product-id match for the same identifier.
    pub async fn get_by_price_or_product_id(
        &self,
        provider: &str,
        id: &str,
    ) -> BillingResult<Option<PaymentPlan>> {
        // NULLS LAST: a product-matched row with a null price_id makes the
        // sort expression NULL, which DESC would otherwise rank ahead of
        // the TRUE price-id match.
        let row: Option<PaymentPlan> = sqlx::query_as(
            r#"
            SELECT provider, price_id, product_id, display_name, credits_per_cycle, active
            FROM payment_plans
            WHERE provider = $1
              AND active
              AND (price_id = $2 OR product_id = $2)
            ORDER BY (price_id = $2) DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(provider)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
