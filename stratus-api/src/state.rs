use std::sync::Arc;
use stratus_cart::CartService;
use stratus_core::events::EventPublisher;
use stratus_core::payment::GatewayRegistry;
use stratus_core::repository::{
    BillingRepository, CartRepository, CatalogRepository, CustomerRepository, OrderRepository, TaxRuleRepository,
};
use stratus_core::TaxCalculator;
use stratus_order::{OrderManager, ServiceManager};
use stratus_payment::PaymentService;

/// Storage backends the API can run on.
pub trait BillingStore:
    CustomerRepository + TaxRuleRepository + CatalogRepository + CartRepository + OrderRepository + BillingRepository
{
}

impl<T> BillingStore for T where
    T: CustomerRepository + TaxRuleRepository + CatalogRepository + CartRepository + OrderRepository + BillingRepository
{
}

#[derive(Clone)]
pub struct AppSettings {
    pub default_currency: String,
    pub payment_request_ttl: chrono::Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            payment_request_ttl: chrono::Duration::hours(1),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderManager>,
    pub services: Arc<ServiceManager>,
    pub payments: Arc<PaymentService>,
    pub settings: AppSettings,
}

impl AppState {
    pub fn new<S>(store: Arc<S>, gateways: GatewayRegistry, events: Arc<dyn EventPublisher>, settings: AppSettings) -> Self
    where
        S: BillingStore + 'static,
    {
        let tax = TaxCalculator::new(store.clone(), store.clone());

        let carts = CartService::new(store.clone(), store.clone(), tax.clone());
        let orders = OrderManager::new(store.clone(), store.clone(), tax, events.clone());
        let services = ServiceManager::new(store.clone(), events.clone());
        let payments =
            PaymentService::new(store, gateways, events).with_request_ttl(settings.payment_request_ttl);

        Self {
            carts: Arc::new(carts),
            orders: Arc::new(orders),
            services: Arc::new(services),
            payments: Arc::new(payments),
            settings,
        }
    }
}
