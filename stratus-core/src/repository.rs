//! Persistence seams for the billing core.
//!
//! Every mutation of a hot shared value (cart items at checkout, a customer's
//! credit, an original transaction's refunded total, a payment request's
//! status) goes through a method that takes a *plan* closure. The store locks
//! the rows, hands the current state to the closure, and commits whatever the
//! closure returns together with its audit rows, or nothing if the closure
//! fails. Business rules stay in the services; atomicity stays in the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Cart, CartItem, ConfigOption, Coupon, CreditAdjustment, Customer, Gateway, GatewayWebhookLog,
    Invoice, Order, PaymentRequest, PaymentRequestStatus, PaymentSubscription,
    Product, ProductPricing, Service, Transaction, WebhookConfig, WebhookDelivery,
};
use crate::tax::TaxRule;
use crate::CoreResult;

/// Result of pricing a locked cart: the order snapshot and its invoice.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub order: Order,
    pub invoice: Invoice,
}

/// Activated order plus the services created for it.
#[derive(Debug, Clone)]
pub struct Activation {
    pub order: Order,
    pub services: Vec<Service>,
}

/// Effects of paying an invoice from credit.
#[derive(Debug, Clone)]
pub struct CreditPayment {
    pub adjustment: CreditAdjustment,
    pub transaction: Transaction,
    pub invoice: Invoice,
}

/// Cancelled order plus its invoice when that was cancelled with it.
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub order: Order,
    pub invoice: Option<Invoice>,
}

/// Effects of a successful gateway charge.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub request: PaymentRequest,
    pub transaction: Transaction,
    pub invoice: Option<Invoice>,
}

pub type CheckoutFn = Box<dyn FnOnce(Cart) -> CoreResult<Checkout> + Send>;
pub type ActivationFn = Box<dyn FnOnce(Order) -> CoreResult<Activation> + Send>;
pub type CancelFn = Box<dyn FnOnce(Order, Option<Invoice>) -> CoreResult<Cancellation> + Send>;
pub type ServiceFn = Box<dyn FnOnce(Service) -> CoreResult<Service> + Send>;
pub type CreditFn = Box<dyn FnOnce(&Customer) -> CoreResult<CreditAdjustment> + Send>;
pub type CreditPaymentFn = Box<dyn FnOnce(&Customer, Invoice) -> CoreResult<CreditPayment> + Send>;
pub type RefundFn = Box<dyn FnOnce(&Transaction) -> CoreResult<Transaction> + Send>;
pub type SettlementFn = Box<dyn FnOnce(PaymentRequest, Option<Invoice>) -> CoreResult<Settlement> + Send>;

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>>;
}

#[async_trait]
pub trait TaxRuleRepository: Send + Sync {
    /// Active rules for the country whose state matches or is unrestricted,
    /// ordered by priority descending then id ascending.
    async fn list_active_tax_rules(&self, country: &str, state: &str) -> CoreResult<Vec<TaxRule>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_product(&self, id: Uuid) -> CoreResult<Option<Product>>;

    /// Price rows for the product in one currency, enabled or not.
    async fn list_product_pricing(&self, product_id: Uuid, currency: &str) -> CoreResult<Vec<ProductPricing>>;

    async fn list_config_options(&self, product_id: Uuid) -> CoreResult<Vec<ConfigOption>>;

    /// Case-insensitive lookup.
    async fn get_coupon(&self, code: &str) -> CoreResult<Option<Coupon>>;
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn create_cart(&self, cart: &Cart) -> CoreResult<()>;

    /// Cart with its items in insertion order.
    async fn get_cart(&self, id: Uuid) -> CoreResult<Option<Cart>>;

    async fn get_cart_item(&self, item_id: Uuid) -> CoreResult<Option<CartItem>>;

    /// Appends under the cart lock; fails with NotFound once the cart has been
    /// checked out.
    async fn add_cart_item(&self, item: &CartItem) -> CoreResult<()>;

    async fn update_cart_item(&self, item: &CartItem) -> CoreResult<()>;

    async fn remove_cart_item(&self, item_id: Uuid) -> CoreResult<()>;

    /// Store the applied coupon and the re-priced items in one commit.
    async fn save_cart_pricing(&self, cart_id: Uuid, coupon_code: Option<&str>, items: &[CartItem]) -> CoreResult<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Lock the cart, price it with `build`, persist order + items + invoice,
    /// consume one coupon use, and delete the cart, all in one transaction.
    async fn checkout(&self, cart_id: Uuid, build: CheckoutFn) -> CoreResult<Checkout>;

    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>>;

    async fn list_orders(&self, customer_id: Uuid) -> CoreResult<Vec<Order>>;

    /// Lock the order, let `activate` produce the services, persist them, link
    /// each item to its service and store the new order status.
    async fn activate_order(&self, order_id: Uuid, activate: ActivationFn) -> CoreResult<Activation>;

    /// Lock the order, then its invoice; store whatever `cancel` returns for
    /// both in one transaction.
    async fn cancel_order(&self, order_id: Uuid, cancel: CancelFn) -> CoreResult<Cancellation>;

    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>>;

    /// Lock the service, hand it to `change` and store the result.
    async fn update_service(&self, id: Uuid, change: ServiceFn) -> CoreResult<Service>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn get_invoice(&self, id: Uuid) -> CoreResult<Option<Invoice>>;

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<Transaction>>;

    async fn list_credit_adjustments(&self, customer_id: Uuid) -> CoreResult<Vec<CreditAdjustment>>;

    /// Lock the customer, compute the adjustment, store the new balance and the
    /// adjustment row together.
    async fn adjust_credit(&self, customer_id: Uuid, plan: CreditFn) -> CoreResult<CreditAdjustment>;

    /// Lock customer and invoice; commit credit deduction, adjustment,
    /// transaction and invoice update together.
    async fn pay_invoice_with_credit(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        plan: CreditPaymentFn,
    ) -> CoreResult<CreditPayment>;

    /// Lock the original transaction; insert the refund row and bump the
    /// original's refunded total together. A pending refund row reserves its
    /// amount until it is completed or released.
    async fn record_refund(&self, original_id: Uuid, plan: RefundFn) -> CoreResult<Transaction>;

    /// Mark a pending refund completed with the processor's reference.
    async fn complete_refund(&self, refund_id: Uuid, gateway_reference: &str) -> CoreResult<Transaction>;

    /// Mark a pending refund failed and give its amount back to the original.
    async fn release_refund(&self, refund_id: Uuid) -> CoreResult<Transaction>;

    async fn create_payment_request(&self, request: &PaymentRequest) -> CoreResult<()>;

    async fn get_payment_request(&self, id: Uuid) -> CoreResult<Option<PaymentRequest>>;

    /// Pending to processing; false when another caller got there first.
    async fn claim_payment_request(&self, id: Uuid) -> CoreResult<bool>;

    /// Set a terminal non-success status, only while the request is in `from`.
    async fn close_payment_request(
        &self,
        id: Uuid,
        from: PaymentRequestStatus,
        status: PaymentRequestStatus,
        error_message: Option<&str>,
    ) -> CoreResult<bool>;

    /// Lock the request (and its invoice), commit transaction, request linkage
    /// and invoice update together.
    async fn settle_payment_request(&self, id: Uuid, plan: SettlementFn) -> CoreResult<Settlement>;

    async fn get_gateway(&self, id: Uuid) -> CoreResult<Option<Gateway>>;

    async fn get_gateway_by_slug(&self, slug: &str) -> CoreResult<Option<Gateway>>;

    async fn create_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()>;

    async fn get_subscription(&self, id: Uuid) -> CoreResult<Option<PaymentSubscription>>;

    async fn update_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()>;

    async fn record_gateway_webhook(&self, log: &GatewayWebhookLog) -> CoreResult<()>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    /// Active configs subscribed to the event or to the wildcard.
    async fn list_active_webhooks(&self, event_type: &str) -> CoreResult<Vec<WebhookConfig>>;

    async fn create_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()>;

    async fn mark_webhook_triggered(&self, webhook_id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;

    async fn increment_webhook_failures(&self, webhook_id: Uuid) -> CoreResult<()>;
}
