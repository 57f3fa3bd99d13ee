use async_trait::async_trait;
use stratus_core::models::{ConfigOption, ConfigSubOption, Coupon, Product, ProductPricing};
use stratus_core::repository::CatalogRepository;
use stratus_core::CoreResult;
use tracing::warn;
use uuid::Uuid;

use crate::database::{db_err, PgStore};
use crate::rows::{ConfigOptionRow, CouponRow, PricingRow, ProductRow, SubOptionRow};

#[async_trait]
impl CatalogRepository for PgStore {
    async fn get_product(&self, id: Uuid) -> CoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, description, is_active, created_at FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Product::from))
    }

    async fn list_product_pricing(&self, product_id: Uuid, currency: &str) -> CoreResult<Vec<ProductPricing>> {
        let rows = sqlx::query_as::<_, PricingRow>(
            r#"
            SELECT product_id, currency, billing_cycle, setup_fee, recurring_fee, enabled
            FROM product_pricing
            WHERE product_id = $1 AND upper(currency) = upper($2)
            "#,
        )
        .bind(product_id)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut pricing = Vec::with_capacity(rows.len());
        for row in rows {
            let cycle = row.billing_cycle.clone();
            match row.into_pricing() {
                Some(p) => pricing.push(p),
                None => warn!(%product_id, cycle = %cycle, "Skipping price row with unknown billing cycle"),
            }
        }
        Ok(pricing)
    }

    async fn list_config_options(&self, product_id: Uuid) -> CoreResult<Vec<ConfigOption>> {
        let options = sqlx::query_as::<_, ConfigOptionRow>(
            "SELECT id, product_id, name FROM config_options WHERE product_id = $1 ORDER BY sort_order, name",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let subs = sqlx::query_as::<_, SubOptionRow>(
            r#"
            SELECT s.id, s.option_id, s.name, s.setup_fee, s.monthly_fee
            FROM config_sub_options s
            JOIN config_options o ON o.id = s.option_id
            WHERE o.product_id = $1
            ORDER BY s.sort_order, s.name
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let subs: Vec<ConfigSubOption> = subs.into_iter().map(ConfigSubOption::from).collect();
        Ok(options
            .into_iter()
            .map(|row| ConfigOption {
                sub_options: subs.iter().filter(|s| s.option_id == row.id).cloned().collect(),
                id: row.id,
                product_id: row.product_id,
                name: row.name,
            })
            .collect())
    }

    async fn get_coupon(&self, code: &str) -> CoreResult<Option<Coupon>> {
        let row = sqlx::query_as::<_, CouponRow>(
            r#"
            SELECT id, code, discount_type, value, product_ids, starts_at, expires_at,
                   max_uses, uses, is_active
            FROM coupons
            WHERE code = upper($1)
            "#,
        )
        .bind(code.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Coupon::try_from).transpose()
    }
}
