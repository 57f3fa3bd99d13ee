use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use stratus_core::events::EventPublisher;
use stratus_core::models::{Cart, CartItem, Invoice, InvoiceStatus, Order, OrderItem, OrderStatus, Service};
use stratus_core::repository::{Activation, Cancellation, CartRepository, Checkout, OrderRepository};
use stratus_core::tax::{compute_tax, TaxRule};
use stratus_core::{CoreError, CoreResult, TaxCalculator};
use stratus_shared::models::events::event_types;
use stratus_shared::DomainEvent;
use tracing::{info, warn};
use uuid::Uuid;

use crate::number::OrderNumberGenerator;

/// Order lifecycle: checkout of a cart into an order, activation into
/// services, cancellation.
pub struct OrderManager {
    carts: Arc<dyn CartRepository>,
    orders: Arc<dyn OrderRepository>,
    tax: TaxCalculator,
    numbers: OrderNumberGenerator,
    events: Arc<dyn EventPublisher>,
}

impl OrderManager {
    pub fn new(
        carts: Arc<dyn CartRepository>,
        orders: Arc<dyn OrderRepository>,
        tax: TaxCalculator,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            carts,
            orders,
            tax,
            numbers: OrderNumberGenerator::new(),
            events,
        }
    }

    /// Convert a cart into a pending order and its unpaid invoice. The cart is
    /// deleted in the same commit; on any failure it is left as it was.
    pub async fn create_order(&self, customer_id: Uuid, cart_id: Uuid, ip_address: Option<String>) -> CoreResult<Order> {
        let cart = self
            .carts
            .get_cart(cart_id)
            .await?
            .ok_or_else(|| CoreError::not_found("cart", cart_id))?;
        ensure_checkout_allowed(&cart, customer_id)?;

        // Rules are resolved up front; the amount they apply to is only known
        // once the cart is locked.
        let rules = self.tax.rules_for_customer(customer_id).await?;
        let order_number = self.numbers.next();

        let checkout = self
            .orders
            .checkout(
                cart_id,
                Box::new(move |cart| build_checkout(cart, customer_id, order_number, ip_address, &rules)),
            )
            .await?;

        let order = checkout.order;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            customer_id = %customer_id,
            total = %order.total,
            "Order created"
        );
        self.events.publish(DomainEvent::new(
            event_types::ORDER_CREATED,
            Some(customer_id),
            json!({
                "order_id": order.id,
                "order_number": order.order_number,
                "invoice_id": checkout.invoice.id,
                "currency": order.currency,
                "total": order.total,
            }),
        ));
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))
    }

    pub async fn list_orders(&self, customer_id: Uuid) -> CoreResult<Vec<Order>> {
        self.orders.list_orders(customer_id).await
    }

    /// Create one pending service per order item and move the order to
    /// active, all or nothing.
    pub async fn activate_order(&self, order_id: Uuid) -> CoreResult<Activation> {
        let activation = self
            .orders
            .activate_order(order_id, Box::new(build_activation))
            .await?;

        info!(
            order_id = %order_id,
            services = activation.services.len(),
            "Order activated"
        );
        self.events.publish(DomainEvent::new(
            event_types::ORDER_ACTIVATED,
            Some(activation.order.customer_id),
            json!({
                "order_id": order_id,
                "order_number": activation.order.order_number,
                "service_ids": activation.services.iter().map(|s| s.id).collect::<Vec<_>>(),
            }),
        ));
        Ok(activation)
    }

    /// Pending orders only. The order's invoice is cancelled in the same
    /// commit; an order whose invoice has taken money is refused.
    pub async fn cancel_order(&self, order_id: Uuid) -> CoreResult<Order> {
        let cancellation = self.orders.cancel_order(order_id, Box::new(build_cancellation)).await?;

        let order = cancellation.order;
        info!(
            order_id = %order_id,
            invoice_cancelled = cancellation.invoice.is_some(),
            "Order cancelled"
        );
        self.events.publish(DomainEvent::new(
            event_types::ORDER_CANCELLED,
            Some(order.customer_id),
            json!({ "order_id": order.id, "order_number": order.order_number }),
        ));
        Ok(order)
    }
}

fn ensure_checkout_allowed(cart: &Cart, customer_id: Uuid) -> CoreResult<()> {
    if matches!(cart.owner.customer_id(), Some(owner) if owner != customer_id) {
        // Someone else's cart is reported as missing.
        return Err(CoreError::not_found("cart", cart.id));
    }
    if cart.is_empty() {
        return Err(CoreError::CartEmpty(cart.id));
    }
    Ok(())
}

/// Price a locked cart into an order snapshot plus its invoice.
pub fn build_checkout(
    cart: Cart,
    customer_id: Uuid,
    order_number: String,
    ip_address: Option<String>,
    rules: &[TaxRule],
) -> CoreResult<Checkout> {
    ensure_checkout_allowed(&cart, customer_id)?;

    let subtotal: Decimal = cart.items.iter().map(CartItem::gross).sum();
    let discount: Decimal = cart.items.iter().map(|i| i.discount).sum();
    let taxable = subtotal - discount;
    let tax_amount = compute_tax(taxable, rules).amount;
    let total = taxable + tax_amount;

    let now = Utc::now();
    let order_id = Uuid::new_v4();
    let invoice = Invoice::new(customer_id, Some(order_id), &cart.currency, total);

    let order = Order {
        id: order_id,
        order_number,
        customer_id,
        invoice_id: Some(invoice.id),
        currency: cart.currency.clone(),
        subtotal,
        discount,
        tax_amount,
        total,
        coupon_code: cart.coupon_code.clone(),
        ip_address,
        status: OrderStatus::Pending,
        items: cart.items.iter().map(|item| OrderItem::from_cart_item(order_id, item)).collect(),
        created_at: now,
        updated_at: now,
    };
    Ok(Checkout { order, invoice })
}

fn build_cancellation(mut order: Order, invoice: Option<Invoice>) -> CoreResult<Cancellation> {
    if order.status != OrderStatus::Pending {
        return Err(CoreError::InvalidTransition {
            from: order.status.to_string(),
            to: OrderStatus::Cancelled.to_string(),
        });
    }

    let now = Utc::now();
    let invoice = match invoice {
        Some(invoice) if invoice.status == InvoiceStatus::Paid || !invoice.amount_paid.is_zero() => {
            return Err(CoreError::Conflict(format!(
                "invoice {} has payments of {}; refund them before cancelling order {}",
                invoice.id, invoice.amount_paid, order.order_number
            )));
        }
        Some(mut invoice) if invoice.status == InvoiceStatus::Unpaid => {
            invoice.status = InvoiceStatus::Cancelled;
            invoice.updated_at = now;
            Some(invoice)
        }
        Some(_) => None,
        None => {
            if let Some(invoice_id) = order.invoice_id {
                warn!(order_id = %order.id, invoice_id = %invoice_id, "Order references a missing invoice");
            }
            None
        }
    };

    order.status = OrderStatus::Cancelled;
    order.updated_at = now;
    Ok(Cancellation { order, invoice })
}

fn build_activation(mut order: Order) -> CoreResult<Activation> {
    if order.status != OrderStatus::Pending {
        return Err(CoreError::InvalidTransition {
            from: order.status.to_string(),
            to: OrderStatus::Active.to_string(),
        });
    }

    let now = Utc::now();
    let customer_id = order.customer_id;
    let mut services = Vec::with_capacity(order.items.len());
    for item in order.items.iter_mut() {
        let service = Service::from_order_item(customer_id, item, now);
        item.service_id = Some(service.id);
        services.push(service);
    }
    order.status = OrderStatus::Active;
    order.updated_at = now;

    Ok(Activation { order, services })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::events::RecordingPublisher;
    use stratus_core::models::{CartOwner, Coupon, Customer, DiscountType, ServiceStatus};
    use stratus_core::repository::BillingRepository;
    use stratus_core::{BillingCycle, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        events: Arc<RecordingPublisher>,
        manager: OrderManager,
        customer_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let customer = Customer::new("buyer@example.com", Some("us"), None, "USD");
        let customer_id = customer.id;
        store.insert_customer(customer).await;
        store
            .insert_tax_rule(TaxRule {
                id: 1,
                name: "Sales tax".into(),
                country: "US".into(),
                state: None,
                rate: Decimal::new(10, 0),
                priority: 1,
                inclusive: false,
                is_active: true,
            })
            .await;

        let events = Arc::new(RecordingPublisher::new());
        let tax = TaxCalculator::new(store.clone(), store.clone());
        let manager = OrderManager::new(store.clone(), store.clone(), tax, events.clone());
        Fixture {
            store,
            events,
            manager,
            customer_id,
        }
    }

    fn vps_line(cart_id: Uuid) -> CartItem {
        let mut item = CartItem::new(
            cart_id,
            Uuid::new_v4(),
            "VPS".into(),
            BillingCycle::Quarterly,
            2,
            Decimal::new(10, 0),
            Decimal::new(20, 0),
            vec![],
        );
        item.domain = Some("example.com".into());
        item.set_discount(Decimal::new(5, 0));
        item
    }

    async fn cart_with_line(f: &Fixture, owner: CartOwner) -> (Cart, CartItem) {
        let cart = Cart::new(owner, "USD");
        f.store.create_cart(&cart).await.unwrap();
        let item = vps_line(cart.id);
        f.store.add_cart_item(&item).await.unwrap();
        (cart, item)
    }

    #[tokio::test]
    async fn test_create_order_totals_and_snapshot() {
        let f = fixture().await;
        let (cart, item) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;

        let order = f
            .manager
            .create_order(f.customer_id, cart.id, Some("203.0.113.9".into()))
            .await
            .unwrap();

        assert_eq!(order.subtotal, Decimal::new(60, 0));
        assert_eq!(order.discount, Decimal::new(5, 0));
        assert_eq!(order.tax_amount, Decimal::new(550, 2));
        assert_eq!(order.total, Decimal::new(6050, 2));
        assert!(order.is_balanced());
        assert_eq!(order.status, OrderStatus::Pending);

        let copied = &order.items[0];
        assert_eq!(copied.product_id, item.product_id);
        assert_eq!(copied.quantity, 2);
        assert_eq!(copied.total, item.total);
        assert_eq!(copied.domain.as_deref(), Some("example.com"));
        assert!(copied.service_id.is_none());

        assert!(f.store.get_cart(cart.id).await.unwrap().is_none());
        let invoice = f.store.get_invoice(order.invoice_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(invoice.total, order.total);
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(f.events.event_types(), vec![event_types::ORDER_CREATED]);
    }

    #[tokio::test]
    async fn test_empty_cart_is_rejected_and_kept() {
        let f = fixture().await;
        let cart = Cart::new(CartOwner::Customer(f.customer_id), "USD");
        f.store.create_cart(&cart).await.unwrap();

        let err = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::CartEmpty(id) if id == cart.id));
        assert!(f.store.get_cart(cart.id).await.unwrap().is_some());
        assert!(f.events.event_types().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_cart_is_not_found() {
        let f = fixture().await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(Uuid::new_v4())).await;

        let err = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "cart", .. }));
    }

    #[tokio::test]
    async fn test_exhausted_coupon_rolls_back_checkout() {
        let f = fixture().await;
        let mut coupon = Coupon::new("ONCE", DiscountType::FixedAmount, Decimal::new(1, 0));
        coupon.max_uses = Some(1);
        coupon.uses = 1;
        f.store.insert_coupon(coupon).await;

        let (cart, _) = cart_with_line(&f, CartOwner::Session("guest".into())).await;
        f.store
            .save_cart_pricing(cart.id, Some("ONCE"), &[])
            .await
            .unwrap();

        let err = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidCoupon(_)));
        assert!(f.store.get_cart(cart.id).await.unwrap().is_some());
        assert!(f.manager.list_orders(f.customer_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coupon_use_is_counted() {
        let f = fixture().await;
        f.store
            .insert_coupon(Coupon::new("WELCOME", DiscountType::Percentage, Decimal::new(10, 0)))
            .await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;
        f.store.save_cart_pricing(cart.id, Some("WELCOME"), &[]).await.unwrap();

        let order = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap();
        assert_eq!(order.coupon_code.as_deref(), Some("WELCOME"));
        assert_eq!(f.store.coupon("WELCOME").await.unwrap().uses, 1);
    }

    #[tokio::test]
    async fn test_activation_creates_linked_services() {
        let f = fixture().await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;
        let order = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap();

        let activation = f.manager.activate_order(order.id).await.unwrap();
        assert_eq!(activation.order.status, OrderStatus::Active);
        assert_eq!(activation.services.len(), 1);

        let service = &activation.services[0];
        assert_eq!(service.status, ServiceStatus::Pending);
        assert_eq!(service.billing_cycle, BillingCycle::Quarterly);
        assert_eq!(service.domain.as_deref(), Some("example.com"));
        assert_eq!(service.next_due_date, BillingCycle::Quarterly.advance(service.registration_date));

        let stored = f.manager.get_order(order.id).await.unwrap();
        assert_eq!(stored.items[0].service_id, Some(service.id));
        assert_eq!(f.store.services_for_order(order.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_activation_changes_nothing() {
        let f = fixture().await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;
        let order = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap();
        f.manager.activate_order(order.id).await.unwrap();

        let err = f.manager.activate_order(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(f.store.services_for_order(order.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let f = fixture().await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;
        let order = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap();

        let cancelled = f.manager.cancel_order(order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let invoice = f.store.get_invoice(order.invoice_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Cancelled);

        assert!(matches!(
            f.manager.cancel_order(order.id).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.manager.activate_order(order.id).await,
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_refuses_invoice_with_payments() {
        let f = fixture().await;
        let (cart, _) = cart_with_line(&f, CartOwner::Customer(f.customer_id)).await;
        let order = f.manager.create_order(f.customer_id, cart.id, None).await.unwrap();

        let invoice_id = order.invoice_id.unwrap();
        let mut invoice = f.store.get_invoice(invoice_id).await.unwrap().unwrap();
        invoice.apply_payment(Decimal::new(10, 0), Utc::now());
        f.store.insert_invoice(invoice).await;

        let err = f.manager.cancel_order(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        assert_eq!(f.manager.get_order(order.id).await.unwrap().status, OrderStatus::Pending);
        let stored = f.store.get_invoice(invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Unpaid);
        assert_eq!(stored.amount_paid, Decimal::new(10, 0));
        assert!(!f.events.event_types().contains(&event_types::ORDER_CANCELLED.to_string()));
    }

    #[tokio::test]
    async fn test_missing_order() {
        let f = fixture().await;
        let err = f.manager.activate_order(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "order", .. }));
    }
}
