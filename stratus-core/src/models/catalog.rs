use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;
use crate::billing_cycle::BillingCycle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// One row of a product's price table: fees for a currency and cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPricing {
    pub product_id: Uuid,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub enabled: bool,
}

/// A configurable option group (e.g. "RAM") with selectable sub-options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOption {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub sub_options: Vec<ConfigSubOption>,
}

/// Sub-option fees. `monthly_fee` is scaled by the cycle length in months.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSubOption {
    pub id: Uuid,
    pub option_id: Uuid,
    pub name: String,
    pub setup_fee: Decimal,
    pub monthly_fee: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    Percentage,
    FixedAmount,
}

text_enum!(DiscountType {
    Percentage => "percentage",
    FixedAmount => "fixed_amount",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    /// Percent for `Percentage`, per-unit amount for `FixedAmount`.
    pub value: Decimal,
    /// Empty means every product.
    pub product_ids: Vec<Uuid>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub uses: i32,
    pub is_active: bool,
}

impl Coupon {
    pub fn new(code: &str, discount_type: DiscountType, value: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.to_uppercase(),
            discount_type,
            value,
            product_ids: Vec::new(),
            starts_at: None,
            expires_at: None,
            max_uses: None,
            uses: 0,
            is_active: true,
        }
    }

    pub fn applies_to(&self, product_id: Uuid) -> bool {
        self.product_ids.is_empty() || self.product_ids.contains(&product_id)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_uses, Some(max) if self.uses >= max)
    }
}
