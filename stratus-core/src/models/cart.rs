use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing_cycle::BillingCycle;

/// Who a cart belongs to: a registered customer or an anonymous session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    Customer(Uuid),
    Session(String),
}

impl CartOwner {
    pub fn customer_id(&self) -> Option<Uuid> {
        match self {
            CartOwner::Customer(id) => Some(*id),
            CartOwner::Session(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub owner: CartOwner,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub items: Vec<CartItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(owner: CartOwner, currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner,
            currency: currency.trim().to_uppercase(),
            coupon_code: None,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A configurable sub-option chosen for a cart line, with the fees it
/// contributed at the time it was priced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedOption {
    pub option_id: Uuid,
    pub sub_option_id: Uuid,
    pub name: String,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
}

/// A cart line. `total` is derived and is recomputed by every mutator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub billing_cycle: BillingCycle,
    pub quantity: i32,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub config_options: Vec<SelectedOption>,
    pub created_at: DateTime<Utc>,
}

impl CartItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cart_id: Uuid,
        product_id: Uuid,
        product_name: String,
        billing_cycle: BillingCycle,
        quantity: i32,
        setup_fee: Decimal,
        recurring_fee: Decimal,
        config_options: Vec<SelectedOption>,
    ) -> Self {
        let mut item = Self {
            id: Uuid::new_v4(),
            cart_id,
            product_id,
            product_name,
            billing_cycle,
            quantity,
            setup_fee,
            recurring_fee,
            discount: Decimal::ZERO,
            total: Decimal::ZERO,
            domain: None,
            hostname: None,
            config_options,
            created_at: Utc::now(),
        };
        item.recompute_total();
        item
    }

    /// (setup + recurring) × quantity, before discount.
    pub fn gross(&self) -> Decimal {
        (self.setup_fee + self.recurring_fee) * Decimal::from(self.quantity)
    }

    pub fn set_quantity(&mut self, quantity: i32) {
        self.quantity = quantity;
        self.recompute_total();
    }

    pub fn set_discount(&mut self, discount: Decimal) {
        self.discount = discount;
        self.recompute_total();
    }

    fn recompute_total(&mut self) {
        self.total = self.gross() - self.discount;
    }
}
