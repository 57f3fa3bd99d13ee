//! In-process store implementing every repository trait.
//!
//! All state sits behind one async mutex, so each plan closure runs against a
//! consistent snapshot and its effects land together. Used by the service
//! tests and by the API when no database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    Cart, CartItem, ConfigOption, Coupon, CreditAdjustment, Customer, Gateway, GatewayWebhookLog,
    Invoice, Order, PaymentRequest, PaymentRequestStatus, PaymentSubscription, Product,
    ProductPricing, Service, Transaction, TransactionStatus, WebhookConfig, WebhookDelivery,
};
use crate::repository::{
    Activation, ActivationFn, BillingRepository, CancelFn, Cancellation, CartRepository,
    CatalogRepository, Checkout, CheckoutFn, CreditFn, CreditPayment, CreditPaymentFn,
    CustomerRepository, OrderRepository, RefundFn, ServiceFn, Settlement, SettlementFn,
    TaxRuleRepository, WebhookRepository,
};
use crate::tax::TaxRule;
use crate::{CoreError, CoreResult};

#[derive(Default)]
struct State {
    customers: HashMap<Uuid, Customer>,
    tax_rules: Vec<TaxRule>,
    products: HashMap<Uuid, Product>,
    pricing: Vec<ProductPricing>,
    config_options: Vec<ConfigOption>,
    coupons: HashMap<String, Coupon>,
    carts: HashMap<Uuid, Cart>,
    orders: HashMap<Uuid, Order>,
    services: HashMap<Uuid, Service>,
    invoices: HashMap<Uuid, Invoice>,
    transactions: HashMap<Uuid, Transaction>,
    credit_adjustments: Vec<CreditAdjustment>,
    payment_requests: HashMap<Uuid, PaymentRequest>,
    gateways: HashMap<Uuid, Gateway>,
    subscriptions: HashMap<Uuid, PaymentSubscription>,
    gateway_webhooks: Vec<GatewayWebhookLog>,
    webhooks: HashMap<Uuid, WebhookConfig>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
}

impl State {
    fn pending_refund_mut(&mut self, refund_id: Uuid) -> CoreResult<&mut Transaction> {
        let refund = self
            .transactions
            .get_mut(&refund_id)
            .ok_or_else(|| CoreError::not_found("transaction", refund_id))?;
        if refund.status != TransactionStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: refund.status.to_string(),
                to: TransactionStatus::Completed.to_string(),
            });
        }
        Ok(refund)
    }

    fn cart_of_item_mut(&mut self, item_id: Uuid) -> Option<&mut Cart> {
        self.carts
            .values_mut()
            .find(|cart| cart.items.iter().any(|i| i.id == item_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.state.lock().await.customers.insert(customer.id, customer);
    }

    pub async fn insert_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn insert_pricing(&self, pricing: ProductPricing) {
        self.state.lock().await.pricing.push(pricing);
    }

    pub async fn insert_config_option(&self, option: ConfigOption) {
        self.state.lock().await.config_options.push(option);
    }

    pub async fn insert_coupon(&self, coupon: Coupon) {
        self.state.lock().await.coupons.insert(coupon.code.to_uppercase(), coupon);
    }

    pub async fn insert_tax_rule(&self, rule: TaxRule) {
        self.state.lock().await.tax_rules.push(rule);
    }

    pub async fn insert_gateway(&self, gateway: Gateway) {
        self.state.lock().await.gateways.insert(gateway.id, gateway);
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.state.lock().await.invoices.insert(invoice.id, invoice);
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        self.state.lock().await.transactions.insert(transaction.id, transaction);
    }

    pub async fn insert_webhook(&self, webhook: WebhookConfig) {
        self.state.lock().await.webhooks.insert(webhook.id, webhook);
    }

    pub async fn coupon(&self, code: &str) -> Option<Coupon> {
        self.state.lock().await.coupons.get(&code.to_uppercase()).cloned()
    }

    pub async fn webhook(&self, id: Uuid) -> Option<WebhookConfig> {
        self.state.lock().await.webhooks.get(&id).cloned()
    }

    pub async fn deliveries(&self) -> Vec<WebhookDelivery> {
        self.state.lock().await.deliveries.values().cloned().collect()
    }

    pub async fn services_for_order(&self, order_id: Uuid) -> Vec<Service> {
        self.state
            .lock()
            .await
            .services
            .values()
            .filter(|s| s.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn gateway_webhook_logs(&self) -> Vec<GatewayWebhookLog> {
        self.state.lock().await.gateway_webhooks.clone()
    }
}

#[async_trait]
impl CustomerRepository for MemoryStore {
    async fn get_customer(&self, id: Uuid) -> CoreResult<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }
}

#[async_trait]
impl TaxRuleRepository for MemoryStore {
    async fn list_active_tax_rules(&self, country: &str, state: &str) -> CoreResult<Vec<TaxRule>> {
        let guard = self.state.lock().await;
        let mut rules: Vec<TaxRule> = guard
            .tax_rules
            .iter()
            .filter(|r| r.matches(country, state))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn get_product(&self, id: Uuid) -> CoreResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn list_product_pricing(&self, product_id: Uuid, currency: &str) -> CoreResult<Vec<ProductPricing>> {
        let guard = self.state.lock().await;
        Ok(guard
            .pricing
            .iter()
            .filter(|p| p.product_id == product_id && p.currency.eq_ignore_ascii_case(currency))
            .cloned()
            .collect())
    }

    async fn list_config_options(&self, product_id: Uuid) -> CoreResult<Vec<ConfigOption>> {
        let guard = self.state.lock().await;
        Ok(guard
            .config_options
            .iter()
            .filter(|o| o.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn get_coupon(&self, code: &str) -> CoreResult<Option<Coupon>> {
        Ok(self.state.lock().await.coupons.get(&code.trim().to_uppercase()).cloned())
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn create_cart(&self, cart: &Cart) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        if guard.carts.contains_key(&cart.id) {
            return Err(CoreError::Conflict(format!("cart {} already exists", cart.id)));
        }
        guard.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn get_cart(&self, id: Uuid) -> CoreResult<Option<Cart>> {
        Ok(self.state.lock().await.carts.get(&id).cloned())
    }

    async fn get_cart_item(&self, item_id: Uuid) -> CoreResult<Option<CartItem>> {
        let guard = self.state.lock().await;
        Ok(guard
            .carts
            .values()
            .flat_map(|c| c.items.iter())
            .find(|i| i.id == item_id)
            .cloned())
    }

    async fn add_cart_item(&self, item: &CartItem) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        let cart = guard
            .carts
            .get_mut(&item.cart_id)
            .ok_or_else(|| CoreError::not_found("cart", item.cart_id))?;
        cart.items.push(item.clone());
        cart.updated_at = Utc::now();
        Ok(())
    }

    async fn update_cart_item(&self, item: &CartItem) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        let cart = guard
            .cart_of_item_mut(item.id)
            .ok_or_else(|| CoreError::not_found("cart item", item.id))?;
        if let Some(existing) = cart.items.iter_mut().find(|i| i.id == item.id) {
            *existing = item.clone();
        }
        cart.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_cart_item(&self, item_id: Uuid) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        let cart = guard
            .cart_of_item_mut(item_id)
            .ok_or_else(|| CoreError::not_found("cart item", item_id))?;
        cart.items.retain(|i| i.id != item_id);
        cart.updated_at = Utc::now();
        Ok(())
    }

    async fn save_cart_pricing(&self, cart_id: Uuid, coupon_code: Option<&str>, items: &[CartItem]) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        let cart = guard
            .carts
            .get_mut(&cart_id)
            .ok_or_else(|| CoreError::not_found("cart", cart_id))?;
        cart.coupon_code = coupon_code.map(str::to_string);
        for priced in items {
            if let Some(existing) = cart.items.iter_mut().find(|i| i.id == priced.id) {
                *existing = priced.clone();
            }
        }
        cart.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn checkout(&self, cart_id: Uuid, build: CheckoutFn) -> CoreResult<Checkout> {
        let mut guard = self.state.lock().await;
        let cart = guard
            .carts
            .get(&cart_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("cart", cart_id))?;

        let checkout = build(cart)?;

        if guard.orders.values().any(|o| o.order_number == checkout.order.order_number) {
            return Err(CoreError::Conflict(format!(
                "order number {} already taken",
                checkout.order.order_number
            )));
        }

        if let Some(code) = checkout.order.coupon_code.as_deref() {
            let coupon = guard
                .coupons
                .get_mut(&code.to_uppercase())
                .ok_or_else(|| CoreError::InvalidCoupon(code.to_string()))?;
            if coupon.is_exhausted() {
                return Err(CoreError::InvalidCoupon(format!("{} has no uses left", code)));
            }
            coupon.uses += 1;
        }

        guard.orders.insert(checkout.order.id, checkout.order.clone());
        guard.invoices.insert(checkout.invoice.id, checkout.invoice.clone());
        guard.carts.remove(&cart_id);
        Ok(checkout)
    }

    async fn get_order(&self, id: Uuid) -> CoreResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn list_orders(&self, customer_id: Uuid) -> CoreResult<Vec<Order>> {
        let guard = self.state.lock().await;
        let mut orders: Vec<Order> = guard
            .orders
            .values()
            .filter(|o| o.customer_id == customer_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn activate_order(&self, order_id: Uuid, activate: ActivationFn) -> CoreResult<Activation> {
        let mut guard = self.state.lock().await;
        let order = guard
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("order", order_id))?;

        let activation = activate(order)?;

        for service in &activation.services {
            guard.services.insert(service.id, service.clone());
        }
        guard.orders.insert(activation.order.id, activation.order.clone());
        Ok(activation)
    }

    async fn cancel_order(&self, order_id: Uuid, cancel: CancelFn) -> CoreResult<Cancellation> {
        let mut guard = self.state.lock().await;
        let order = guard
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("order", order_id))?;
        let invoice = order.invoice_id.and_then(|id| guard.invoices.get(&id).cloned());

        let cancellation = cancel(order, invoice)?;
        guard.orders.insert(cancellation.order.id, cancellation.order.clone());
        if let Some(invoice) = &cancellation.invoice {
            guard.invoices.insert(invoice.id, invoice.clone());
        }
        Ok(cancellation)
    }

    async fn get_service(&self, id: Uuid) -> CoreResult<Option<Service>> {
        Ok(self.state.lock().await.services.get(&id).cloned())
    }

    async fn update_service(&self, id: Uuid, change: ServiceFn) -> CoreResult<Service> {
        let mut guard = self.state.lock().await;
        let existing = guard
            .services
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("service", id))?;

        let updated = change(existing.clone())?;
        *existing = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl BillingRepository for MemoryStore {
    async fn get_invoice(&self, id: Uuid) -> CoreResult<Option<Invoice>> {
        Ok(self.state.lock().await.invoices.get(&id).cloned())
    }

    async fn get_transaction(&self, id: Uuid) -> CoreResult<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn list_credit_adjustments(&self, customer_id: Uuid) -> CoreResult<Vec<CreditAdjustment>> {
        let guard = self.state.lock().await;
        let mut history: Vec<CreditAdjustment> = guard
            .credit_adjustments
            .iter()
            .filter(|a| a.customer_id == customer_id)
            .cloned()
            .collect();
        history.reverse();
        Ok(history)
    }

    async fn adjust_credit(&self, customer_id: Uuid, plan: CreditFn) -> CoreResult<CreditAdjustment> {
        let mut guard = self.state.lock().await;
        let customer = guard
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| CoreError::not_found("customer", customer_id))?;

        let adjustment = plan(&*customer)?;
        customer.credit = adjustment.balance_after;
        guard.credit_adjustments.push(adjustment.clone());
        Ok(adjustment)
    }

    async fn pay_invoice_with_credit(
        &self,
        customer_id: Uuid,
        invoice_id: Uuid,
        plan: CreditPaymentFn,
    ) -> CoreResult<CreditPayment> {
        let mut guard = self.state.lock().await;
        let invoice = guard
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("invoice", invoice_id))?;
        let customer = guard
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| CoreError::not_found("customer", customer_id))?;

        let payment = plan(&*customer, invoice)?;
        customer.credit = payment.adjustment.balance_after;
        guard.credit_adjustments.push(payment.adjustment.clone());
        guard.transactions.insert(payment.transaction.id, payment.transaction.clone());
        guard.invoices.insert(payment.invoice.id, payment.invoice.clone());
        Ok(payment)
    }

    async fn record_refund(&self, original_id: Uuid, plan: RefundFn) -> CoreResult<Transaction> {
        let mut guard = self.state.lock().await;
        let original = guard
            .transactions
            .get_mut(&original_id)
            .ok_or_else(|| CoreError::not_found("transaction", original_id))?;

        let refund = plan(&*original)?;
        original.refunded_amount += refund.amount.abs();
        guard.transactions.insert(refund.id, refund.clone());
        Ok(refund)
    }

    async fn complete_refund(&self, refund_id: Uuid, gateway_reference: &str) -> CoreResult<Transaction> {
        let mut guard = self.state.lock().await;
        let refund = guard.pending_refund_mut(refund_id)?;
        refund.status = TransactionStatus::Completed;
        refund.gateway_reference = Some(gateway_reference.to_string());
        Ok(refund.clone())
    }

    async fn release_refund(&self, refund_id: Uuid) -> CoreResult<Transaction> {
        let mut guard = self.state.lock().await;
        let refund = guard.pending_refund_mut(refund_id)?;
        refund.status = TransactionStatus::Failed;
        let released = refund.clone();

        if let Some(original) = released
            .parent_transaction_id
            .and_then(|id| guard.transactions.get_mut(&id))
        {
            original.refunded_amount -= released.amount.abs();
        }
        Ok(released)
    }

    async fn create_payment_request(&self, request: &PaymentRequest) -> CoreResult<()> {
        self.state.lock().await.payment_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_payment_request(&self, id: Uuid) -> CoreResult<Option<PaymentRequest>> {
        Ok(self.state.lock().await.payment_requests.get(&id).cloned())
    }

    async fn claim_payment_request(&self, id: Uuid) -> CoreResult<bool> {
        let mut guard = self.state.lock().await;
        let request = guard
            .payment_requests
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("payment request", id))?;
        if request.status != PaymentRequestStatus::Pending {
            return Ok(false);
        }
        request.status = PaymentRequestStatus::Processing;
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn close_payment_request(
        &self,
        id: Uuid,
        from: PaymentRequestStatus,
        status: PaymentRequestStatus,
        error_message: Option<&str>,
    ) -> CoreResult<bool> {
        let mut guard = self.state.lock().await;
        let request = guard
            .payment_requests
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("payment request", id))?;
        if request.status != from {
            return Ok(false);
        }
        request.status = status;
        request.error_message = error_message.map(str::to_string);
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn settle_payment_request(&self, id: Uuid, plan: SettlementFn) -> CoreResult<Settlement> {
        let mut guard = self.state.lock().await;
        let request = guard
            .payment_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("payment request", id))?;
        let invoice = request.invoice_id.and_then(|iid| guard.invoices.get(&iid).cloned());

        let settlement = plan(request, invoice)?;
        guard
            .payment_requests
            .insert(settlement.request.id, settlement.request.clone());
        guard
            .transactions
            .insert(settlement.transaction.id, settlement.transaction.clone());
        if let Some(invoice) = &settlement.invoice {
            guard.invoices.insert(invoice.id, invoice.clone());
        }
        Ok(settlement)
    }

    async fn get_gateway(&self, id: Uuid) -> CoreResult<Option<Gateway>> {
        Ok(self.state.lock().await.gateways.get(&id).cloned())
    }

    async fn get_gateway_by_slug(&self, slug: &str) -> CoreResult<Option<Gateway>> {
        let guard = self.state.lock().await;
        Ok(guard.gateways.values().find(|g| g.slug == slug).cloned())
    }

    async fn create_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()> {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> CoreResult<Option<PaymentSubscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(&self, subscription: &PaymentSubscription) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        let existing = guard
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or_else(|| CoreError::not_found("subscription", subscription.id))?;
        *existing = subscription.clone();
        Ok(())
    }

    async fn record_gateway_webhook(&self, log: &GatewayWebhookLog) -> CoreResult<()> {
        self.state.lock().await.gateway_webhooks.push(log.clone());
        Ok(())
    }
}

#[async_trait]
impl WebhookRepository for MemoryStore {
    async fn list_active_webhooks(&self, event_type: &str) -> CoreResult<Vec<WebhookConfig>> {
        let guard = self.state.lock().await;
        Ok(guard
            .webhooks
            .values()
            .filter(|w| w.is_active && w.subscribes_to(event_type))
            .cloned()
            .collect())
    }

    async fn create_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()> {
        self.state.lock().await.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()> {
        self.state.lock().await.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn mark_webhook_triggered(&self, webhook_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        if let Some(webhook) = guard.webhooks.get_mut(&webhook_id) {
            webhook.last_triggered = Some(at);
        }
        Ok(())
    }

    async fn increment_webhook_failures(&self, webhook_id: Uuid) -> CoreResult<()> {
        let mut guard = self.state.lock().await;
        if let Some(webhook) = guard.webhooks.get_mut(&webhook_id) {
            webhook.failure_count += 1;
        }
        Ok(())
    }
}
