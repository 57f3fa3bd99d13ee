use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratus_catalog::OptionSelection;
use stratus_core::models::{Cart, CartItem};
use uuid::Uuid;

/// Input for adding a product to a cart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    pub billing_cycle: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub config_options: Vec<OptionSelection>,
}

fn default_quantity() -> i32 {
    1
}

/// Priced view of a cart. Always computed from the current items.
#[derive(Debug, Clone, Serialize)]
pub struct CartSummary {
    pub cart_id: Uuid,
    pub currency: String,
    pub items: Vec<CartItem>,
    /// Σ (setup + recurring) × quantity, before discount.
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
}

impl CartSummary {
    pub fn new(cart: Cart, tax: Decimal) -> Self {
        let subtotal: Decimal = cart.items.iter().map(CartItem::gross).sum();
        let total_discount: Decimal = cart.items.iter().map(|i| i.discount).sum();
        Self {
            cart_id: cart.id,
            currency: cart.currency,
            items: cart.items,
            subtotal,
            total_discount,
            tax,
            total: subtotal - total_discount + tax,
            coupon_code: cart.coupon_code,
        }
    }

    pub fn taxable(items: &[CartItem]) -> Decimal {
        items.iter().map(|i| i.gross() - i.discount).sum()
    }
}
