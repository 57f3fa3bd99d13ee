use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use stratus_core::models::{Coupon, Product, SelectedOption};
use stratus_core::repository::CatalogRepository;
use stratus_core::{BillingCycle, CoreError, CoreResult};
use stratus_shared::round_money;
use uuid::Uuid;

use crate::coupon::validate_coupon;

/// A configurable option choice as submitted by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionSelection {
    pub option_id: Uuid,
    pub sub_option_id: Uuid,
}

/// Unit fees for one product at one cycle, options included.
#[derive(Debug, Clone)]
pub struct ItemQuote {
    pub product: Product,
    pub billing_cycle: BillingCycle,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub options: Vec<SelectedOption>,
}

/// Reads the product price table and configurable options. Never caches:
/// every quote reflects the catalog as it is now.
pub struct PricingEngine {
    catalog: Arc<dyn CatalogRepository>,
}

impl PricingEngine {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }

    pub async fn quote(
        &self,
        product_id: Uuid,
        currency: &str,
        billing_cycle: &str,
        selections: &[OptionSelection],
    ) -> CoreResult<ItemQuote> {
        let product = self
            .catalog
            .get_product(product_id)
            .await?
            .ok_or_else(|| CoreError::not_found("product", product_id))?;
        if !product.is_active {
            return Err(CoreError::ValidationError(format!("product {} is not for sale", product.name)));
        }

        let rows = self.catalog.list_product_pricing(product_id, currency).await?;
        if rows.is_empty() {
            return Err(CoreError::PricingNotFound(product_id));
        }

        let cycle: BillingCycle = billing_cycle
            .parse()
            .map_err(|_| CoreError::InvalidBillingCycle(billing_cycle.to_string()))?;
        let row = rows
            .iter()
            .find(|r| r.billing_cycle == cycle && r.enabled)
            .ok_or_else(|| CoreError::InvalidBillingCycle(format!("{} is not offered for {}", cycle, product.name)))?;

        let mut setup_fee = row.setup_fee;
        let mut recurring_fee = row.recurring_fee;
        let options = self.resolve_options(product_id, cycle, selections).await?;
        for option in &options {
            setup_fee += option.setup_fee;
            recurring_fee += option.recurring_fee;
        }

        Ok(ItemQuote {
            product,
            billing_cycle: cycle,
            setup_fee: round_money(setup_fee),
            recurring_fee: round_money(recurring_fee),
            options,
        })
    }

    /// Looks a coupon code up and checks it can be used at `now`.
    pub async fn resolve_coupon(&self, code: &str, now: DateTime<Utc>) -> CoreResult<Coupon> {
        let coupon = self.catalog.get_coupon(code).await?;
        validate_coupon(coupon, code, now)
    }

    async fn resolve_options(
        &self,
        product_id: Uuid,
        cycle: BillingCycle,
        selections: &[OptionSelection],
    ) -> CoreResult<Vec<SelectedOption>> {
        if selections.is_empty() {
            return Ok(Vec::new());
        }

        let available = self.catalog.list_config_options(product_id).await?;
        let months = Decimal::from(cycle.months());
        let mut seen = HashSet::new();
        let mut chosen = Vec::with_capacity(selections.len());

        for selection in selections {
            if !seen.insert(selection.option_id) {
                return Err(CoreError::ValidationError(format!(
                    "option {} selected more than once",
                    selection.option_id
                )));
            }
            let option = available
                .iter()
                .find(|o| o.id == selection.option_id)
                .ok_or_else(|| CoreError::ValidationError(format!("unknown option {}", selection.option_id)))?;
            let sub = option
                .sub_options
                .iter()
                .find(|s| s.id == selection.sub_option_id)
                .ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "unknown choice {} for option {}",
                        selection.sub_option_id, option.name
                    ))
                })?;

            chosen.push(SelectedOption {
                option_id: option.id,
                sub_option_id: sub.id,
                name: format!("{}: {}", option.name, sub.name),
                setup_fee: sub.setup_fee,
                recurring_fee: sub.monthly_fee * months,
            });
        }
        Ok(chosen)
    }
}
