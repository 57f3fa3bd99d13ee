use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cart::{CartItem, SelectedOption};
use super::text_enum;
use crate::billing_cycle::BillingCycle;

/// Order status in the lifecycle. Both `Active` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Active,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Active => "active",
    Cancelled => "cancelled",
});

/// Immutable snapshot of a cart at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub currency: String,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    pub ip_address: Option<String>,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Total must equal subtotal − discount + tax at all times.
    pub fn is_balanced(&self) -> bool {
        self.total == self.subtotal - self.discount + self.tax_amount
    }
}

/// A line copied by value from a cart item. Only `service_id` is written after
/// the order is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
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
    pub service_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn from_cart_item(order_id: Uuid, item: &CartItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            billing_cycle: item.billing_cycle,
            quantity: item.quantity,
            setup_fee: item.setup_fee,
            recurring_fee: item.recurring_fee,
            discount: item.discount,
            total: item.total,
            domain: item.domain.clone(),
            hostname: item.hostname.clone(),
            config_options: item.config_options.clone(),
            service_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Pending,
    Active,
    Suspended,
    Terminated,
}

text_enum!(ServiceStatus {
    Pending => "pending",
    Active => "active",
    Suspended => "suspended",
    Terminated => "terminated",
});

/// A recurring subscription created when an order item is activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_id: Uuid,
    pub order_item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub billing_cycle: BillingCycle,
    pub quantity: i32,
    pub recurring_amount: Decimal,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub config_options: Vec<SelectedOption>,
    pub status: ServiceStatus,
    pub registration_date: DateTime<Utc>,
    pub next_due_date: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Pending service for an order line, first due one period from `now`.
    pub fn from_order_item(customer_id: Uuid, item: &OrderItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            order_id: item.order_id,
            order_item_id: item.id,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            billing_cycle: item.billing_cycle,
            quantity: item.quantity,
            recurring_amount: item.recurring_fee * Decimal::from(item.quantity),
            domain: item.domain.clone(),
            hostname: item.hostname.clone(),
            config_options: item.config_options.clone(),
            status: ServiceStatus::Pending,
            registration_date: now,
            next_due_date: item.billing_cycle.advance(now),
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
