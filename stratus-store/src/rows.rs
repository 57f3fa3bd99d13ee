//! Row shapes as selected from Postgres, and their conversion into the core
//! models. Status columns are text; unknown values surface as storage errors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use stratus_core::models::{
    Cart, CartItem, CartOwner, ConfigSubOption, Coupon, CreditAdjustment, Customer, Gateway,
    Invoice, Order, OrderItem, PaymentRequest, PaymentSubscription, Product, ProductPricing,
    SelectedOption, Service, Transaction, WebhookConfig,
};
use stratus_core::tax::TaxRule;
use stratus_core::{BillingCycle, CoreError, CoreResult};
use stratus_shared::Masked;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
pub(crate) struct CustomerRow {
    pub id: Uuid,
    pub email: String,
    pub country: Option<String>,
    pub state: Option<String>,
    pub currency: String,
    pub credit: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            email: row.email,
            country: row.country,
            state: row.state,
            currency: row.currency,
            credit: row.credit,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TaxRuleRow {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub state: Option<String>,
    pub rate: Decimal,
    pub priority: i32,
    pub inclusive: bool,
    pub is_active: bool,
}

impl From<TaxRuleRow> for TaxRule {
    fn from(row: TaxRuleRow) -> Self {
        TaxRule {
            id: row.id,
            name: row.name,
            country: row.country,
            state: row.state,
            rate: row.rate,
            priority: row.priority,
            inclusive: row.inclusive,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ProductRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            description: row.description,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PricingRow {
    pub product_id: Uuid,
    pub currency: String,
    pub billing_cycle: String,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub enabled: bool,
}

impl PricingRow {
    /// Rows with a cycle name this build does not know are skipped.
    pub fn into_pricing(self) -> Option<ProductPricing> {
        let billing_cycle = self.billing_cycle.parse::<BillingCycle>().ok()?;
        Some(ProductPricing {
            product_id: self.product_id,
            currency: self.currency,
            billing_cycle,
            setup_fee: self.setup_fee,
            recurring_fee: self.recurring_fee,
            enabled: self.enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ConfigOptionRow {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct SubOptionRow {
    pub id: Uuid,
    pub option_id: Uuid,
    pub name: String,
    pub setup_fee: Decimal,
    pub monthly_fee: Decimal,
}

impl From<SubOptionRow> for ConfigSubOption {
    fn from(row: SubOptionRow) -> Self {
        ConfigSubOption {
            id: row.id,
            option_id: row.option_id,
            name: row.name,
            setup_fee: row.setup_fee,
            monthly_fee: row.monthly_fee,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CouponRow {
    pub id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub value: Decimal,
    pub product_ids: Vec<Uuid>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub uses: i32,
    pub is_active: bool,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = CoreError;

    fn try_from(row: CouponRow) -> CoreResult<Self> {
        Ok(Coupon {
            id: row.id,
            code: row.code,
            discount_type: row.discount_type.parse()?,
            value: row.value,
            product_ids: row.product_ids,
            starts_at: row.starts_at,
            expires_at: row.expires_at,
            max_uses: row.max_uses,
            uses: row.uses,
            is_active: row.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CartRow {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartRow {
    pub fn into_cart(self, items: Vec<CartItem>) -> CoreResult<Cart> {
        let owner = match (self.customer_id, self.session_id) {
            (Some(customer_id), _) => CartOwner::Customer(customer_id),
            (None, Some(session_id)) => CartOwner::Session(session_id),
            (None, None) => {
                return Err(CoreError::StorageError(format!("cart {} has no owner", self.id)));
            }
        };
        Ok(Cart {
            id: self.id,
            owner,
            currency: self.currency,
            coupon_code: self.coupon_code,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CartItemRow {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub billing_cycle: String,
    pub quantity: i32,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub config_options: Json<Vec<SelectedOption>>,
    pub created_at: DateTime<Utc>,
}

impl From<CartItemRow> for CartItem {
    fn from(row: CartItemRow) -> Self {
        CartItem {
            id: row.id,
            cart_id: row.cart_id,
            product_id: row.product_id,
            product_name: row.product_name,
            billing_cycle: BillingCycle::parse_lenient(&row.billing_cycle),
            quantity: row.quantity,
            setup_fee: row.setup_fee,
            recurring_fee: row.recurring_fee,
            discount: row.discount,
            total: row.total,
            domain: row.domain,
            hostname: row.hostname,
            config_options: row.config_options.0,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct OrderRow {
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
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn into_order(self, items: Vec<OrderItem>) -> CoreResult<Order> {
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            customer_id: self.customer_id,
            invoice_id: self.invoice_id,
            currency: self.currency,
            subtotal: self.subtotal,
            discount: self.discount,
            tax_amount: self.tax_amount,
            total: self.total,
            coupon_code: self.coupon_code,
            ip_address: self.ip_address,
            status: self.status.parse()?,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct OrderItemRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub billing_cycle: String,
    pub quantity: i32,
    pub setup_fee: Decimal,
    pub recurring_fee: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub config_options: Json<Vec<SelectedOption>>,
    pub service_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        OrderItem {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            product_name: row.product_name,
            billing_cycle: BillingCycle::parse_lenient(&row.billing_cycle),
            quantity: row.quantity,
            setup_fee: row.setup_fee,
            recurring_fee: row.recurring_fee,
            discount: row.discount,
            total: row.total,
            domain: row.domain,
            hostname: row.hostname,
            config_options: row.config_options.0,
            service_id: row.service_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ServiceRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_id: Uuid,
    pub order_item_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub billing_cycle: String,
    pub quantity: i32,
    pub recurring_amount: Decimal,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub config_options: Json<Vec<SelectedOption>>,
    pub status: String,
    pub registration_date: DateTime<Utc>,
    pub next_due_date: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ServiceRow> for Service {
    type Error = CoreError;

    fn try_from(row: ServiceRow) -> CoreResult<Self> {
        Ok(Service {
            id: row.id,
            customer_id: row.customer_id,
            order_id: row.order_id,
            order_item_id: row.order_item_id,
            product_id: row.product_id,
            product_name: row.product_name,
            billing_cycle: BillingCycle::parse_lenient(&row.billing_cycle),
            quantity: row.quantity,
            recurring_amount: row.recurring_amount,
            domain: row.domain,
            hostname: row.hostname,
            config_options: row.config_options.0,
            status: row.status.parse()?,
            registration_date: row.registration_date,
            next_due_date: row.next_due_date,
            terminated_at: row.terminated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct InvoiceRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub order_id: Option<Uuid>,
    pub currency: String,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub balance: Decimal,
    pub status: String,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = CoreError;

    fn try_from(row: InvoiceRow) -> CoreResult<Self> {
        Ok(Invoice {
            id: row.id,
            customer_id: row.customer_id,
            order_id: row.order_id,
            currency: row.currency,
            total: row.total,
            amount_paid: row.amount_paid,
            balance: row.balance,
            status: row.status.parse()?,
            due_date: row.due_date,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TransactionRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub gateway_id: Option<Uuid>,
    pub parent_transaction_id: Option<Uuid>,
    pub transaction_type: String,
    pub status: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub refunded_amount: Decimal,
    pub currency: String,
    pub gateway_reference: Option<String>,
    pub description: Option<String>,
    pub staff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = CoreError;

    fn try_from(row: TransactionRow) -> CoreResult<Self> {
        Ok(Transaction {
            id: row.id,
            customer_id: row.customer_id,
            invoice_id: row.invoice_id,
            gateway_id: row.gateway_id,
            parent_transaction_id: row.parent_transaction_id,
            transaction_type: row.transaction_type.parse()?,
            status: row.status.parse()?,
            amount: row.amount,
            fee: row.fee,
            refunded_amount: row.refunded_amount,
            currency: row.currency,
            gateway_reference: row.gateway_reference,
            description: row.description,
            staff_id: row.staff_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CreditAdjustmentRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub currency: String,
    pub reason: String,
    pub invoice_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub staff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditAdjustmentRow> for CreditAdjustment {
    fn from(row: CreditAdjustmentRow) -> Self {
        CreditAdjustment {
            id: row.id,
            customer_id: row.customer_id,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            currency: row.currency,
            reason: row.reason,
            invoice_id: row.invoice_id,
            transaction_id: row.transaction_id,
            staff_id: row.staff_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PaymentRequestRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub gateway_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_token: Option<String>,
    pub status: String,
    pub transaction_id: Option<Uuid>,
    pub gateway_reference: Option<String>,
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRequestRow> for PaymentRequest {
    type Error = CoreError;

    fn try_from(row: PaymentRequestRow) -> CoreResult<Self> {
        Ok(PaymentRequest {
            id: row.id,
            customer_id: row.customer_id,
            invoice_id: row.invoice_id,
            gateway_id: row.gateway_id,
            amount: row.amount,
            currency: row.currency,
            payment_token: row.payment_token,
            status: row.status.parse()?,
            transaction_id: row.transaction_id,
            gateway_reference: row.gateway_reference,
            error_message: row.error_message,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct GatewayRow {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub supports_recurring: bool,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<GatewayRow> for Gateway {
    fn from(row: GatewayRow) -> Self {
        Gateway {
            id: row.id,
            name: row.name,
            slug: row.slug,
            is_active: row.is_active,
            supports_recurring: row.supports_recurring,
            settings: row.settings,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub gateway_id: Uuid,
    pub service_id: Option<Uuid>,
    pub gateway_subscription_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for PaymentSubscription {
    type Error = CoreError;

    fn try_from(row: SubscriptionRow) -> CoreResult<Self> {
        Ok(PaymentSubscription {
            id: row.id,
            customer_id: row.customer_id,
            gateway_id: row.gateway_id,
            service_id: row.service_id,
            gateway_subscription_id: row.gateway_subscription_id,
            amount: row.amount,
            currency: row.currency,
            billing_cycle: BillingCycle::parse_lenient(&row.billing_cycle),
            status: row.status.parse()?,
            cancel_at_period_end: row.cancel_at_period_end,
            current_period_end: row.current_period_end,
            ended_at: row.ended_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WebhookRow {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub url: String,
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub retry_attempts: i32,
    pub timeout_seconds: i32,
    pub failure_count: i64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookRow> for WebhookConfig {
    fn from(row: WebhookRow) -> Self {
        WebhookConfig {
            id: row.id,
            customer_id: row.customer_id,
            url: row.url,
            secret: row.secret.filter(|s| !s.is_empty()).map(Masked::new),
            events: row.events,
            is_active: row.is_active,
            retry_attempts: row.retry_attempts.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            failure_count: row.failure_count,
            last_triggered: row.last_triggered,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing_row(cycle: &str) -> PricingRow {
        PricingRow {
            product_id: Uuid::new_v4(),
            currency: "USD".into(),
            billing_cycle: cycle.into(),
            setup_fee: Decimal::ZERO,
            recurring_fee: Decimal::new(1000, 2),
            enabled: true,
        }
    }

    #[test]
    fn test_pricing_row_with_unknown_cycle_is_skipped() {
        assert!(pricing_row("fortnightly").into_pricing().is_none());
        let known = pricing_row("annually").into_pricing().unwrap();
        assert_eq!(known.billing_cycle, BillingCycle::Annually);
    }

    #[test]
    fn test_cart_row_requires_an_owner() {
        let row = CartRow {
            id: Uuid::new_v4(),
            customer_id: None,
            session_id: None,
            currency: "USD".into(),
            coupon_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(row.into_cart(Vec::new()), Err(CoreError::StorageError(_))));
    }

    #[test]
    fn test_webhook_row_drops_blank_secret() {
        let row = WebhookRow {
            id: Uuid::new_v4(),
            customer_id: None,
            url: "https://hooks.example.com".into(),
            secret: Some(String::new()),
            events: vec!["*".into()],
            is_active: true,
            retry_attempts: -1,
            timeout_seconds: 5,
            failure_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        };
        let config = WebhookConfig::from(row);
        assert!(config.secret.is_none());
        assert_eq!(config.retry_attempts, 0);
    }

    #[test]
    fn test_unknown_status_text_is_a_storage_error() {
        let row = InvoiceRow {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            order_id: None,
            currency: "USD".into(),
            total: Decimal::ONE,
            amount_paid: Decimal::ZERO,
            balance: Decimal::ONE,
            status: "void".into(),
            due_date: Utc::now(),
            paid_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(Invoice::try_from(row), Err(CoreError::StorageError(_))));
    }
}
