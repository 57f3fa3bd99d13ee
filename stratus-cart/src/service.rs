use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use stratus_catalog::{apply_coupon, item_discount, validate_coupon, PricingEngine};
use stratus_core::models::{Cart, CartItem, CartOwner, Coupon};
use stratus_core::repository::{CartRepository, CatalogRepository};
use stratus_core::{CoreError, CoreResult, TaxCalculator};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{AddItemRequest, CartSummary};

pub struct CartService {
    carts: Arc<dyn CartRepository>,
    catalog: Arc<dyn CatalogRepository>,
    pricing: PricingEngine,
    tax: TaxCalculator,
}

impl CartService {
    pub fn new(carts: Arc<dyn CartRepository>, catalog: Arc<dyn CatalogRepository>, tax: TaxCalculator) -> Self {
        Self {
            carts,
            pricing: PricingEngine::new(catalog.clone()),
            catalog,
            tax,
        }
    }

    pub async fn create_cart(&self, owner: CartOwner, currency: &str) -> CoreResult<Cart> {
        if currency.trim().is_empty() {
            return Err(CoreError::ValidationError("currency is required".into()));
        }
        if matches!(&owner, CartOwner::Session(s) if s.trim().is_empty()) {
            return Err(CoreError::ValidationError("session id is required".into()));
        }

        let cart = Cart::new(owner, currency);
        self.carts.create_cart(&cart).await?;
        info!(cart_id = %cart.id, currency = %cart.currency, "Cart created");
        Ok(cart)
    }

    pub async fn get_cart(&self, cart_id: Uuid) -> CoreResult<Cart> {
        self.carts
            .get_cart(cart_id)
            .await?
            .ok_or_else(|| CoreError::not_found("cart", cart_id))
    }

    /// Price a product from the catalog and append it to the cart.
    pub async fn add_item(&self, cart_id: Uuid, request: AddItemRequest) -> CoreResult<CartItem> {
        if request.quantity < 1 {
            return Err(CoreError::ValidationError(format!(
                "quantity must be at least 1, got {}",
                request.quantity
            )));
        }

        let cart = self.get_cart(cart_id).await?;
        let quote = self
            .pricing
            .quote(request.product_id, &cart.currency, &request.billing_cycle, &request.config_options)
            .await?;

        let mut item = CartItem::new(
            cart.id,
            quote.product.id,
            quote.product.name,
            quote.billing_cycle,
            request.quantity,
            quote.setup_fee,
            quote.recurring_fee,
            quote.options,
        );
        item.domain = request.domain;
        item.hostname = request.hostname;

        if let Some(coupon) = self.active_coupon(&cart).await? {
            item.set_discount(item_discount(&coupon, &item));
        }

        self.carts.add_cart_item(&item).await?;
        info!(cart_id = %cart.id, item_id = %item.id, product = %item.product_name, "Cart item added");
        Ok(item)
    }

    /// Change a line's quantity. Zero removes the line and returns None.
    pub async fn update_item(&self, item_id: Uuid, quantity: i32) -> CoreResult<Option<CartItem>> {
        if quantity < 0 {
            return Err(CoreError::ValidationError(format!("quantity cannot be negative, got {}", quantity)));
        }

        let mut item = self
            .carts
            .get_cart_item(item_id)
            .await?
            .ok_or_else(|| CoreError::not_found("cart item", item_id))?;

        if quantity == 0 {
            self.carts.remove_cart_item(item_id).await?;
            return Ok(None);
        }

        let cart = self.get_cart(item.cart_id).await?;
        item.set_quantity(quantity);
        let discount = match self.active_coupon(&cart).await? {
            Some(coupon) => item_discount(&coupon, &item),
            None => Decimal::ZERO,
        };
        item.set_discount(discount);

        self.carts.update_cart_item(&item).await?;
        Ok(Some(item))
    }

    pub async fn remove_item(&self, item_id: Uuid) -> CoreResult<()> {
        if self.carts.get_cart_item(item_id).await?.is_none() {
            return Err(CoreError::not_found("cart item", item_id));
        }
        self.carts.remove_cart_item(item_id).await
    }

    /// Validate the code and re-price every line against it.
    pub async fn apply_coupon(&self, cart_id: Uuid, code: &str) -> CoreResult<CartSummary> {
        let mut cart = self.get_cart(cart_id).await?;
        let coupon = self.pricing.resolve_coupon(code, Utc::now()).await?;

        apply_coupon(Some(&coupon), &mut cart.items);
        self.carts
            .save_cart_pricing(cart.id, Some(&coupon.code), &cart.items)
            .await?;
        cart.coupon_code = Some(coupon.code.clone());

        info!(cart_id = %cart.id, coupon = %coupon.code, "Coupon applied");
        self.summarize(cart).await
    }

    pub async fn remove_coupon(&self, cart_id: Uuid) -> CoreResult<CartSummary> {
        let mut cart = self.get_cart(cart_id).await?;
        apply_coupon(None, &mut cart.items);
        self.carts.save_cart_pricing(cart.id, None, &cart.items).await?;
        cart.coupon_code = None;
        self.summarize(cart).await
    }

    pub async fn get_cart_summary(&self, cart_id: Uuid) -> CoreResult<CartSummary> {
        let cart = self.get_cart(cart_id).await?;
        self.summarize(cart).await
    }

    async fn summarize(&self, cart: Cart) -> CoreResult<CartSummary> {
        let tax = match cart.owner.customer_id() {
            Some(customer_id) => {
                let taxable = CartSummary::taxable(&cart.items);
                self.tax.calculate_for_customer(customer_id, taxable).await?
            }
            None => Decimal::ZERO,
        };
        Ok(CartSummary::new(cart, tax))
    }

    /// The cart's coupon if it is still usable. A coupon that lapsed after it
    /// was applied stops discounting new lines.
    async fn active_coupon(&self, cart: &Cart) -> CoreResult<Option<Coupon>> {
        let Some(code) = cart.coupon_code.as_deref() else {
            return Ok(None);
        };
        let coupon = self.catalog.get_coupon(code).await?;
        match validate_coupon(coupon, code, Utc::now()) {
            Ok(coupon) => Ok(Some(coupon)),
            Err(e) => {
                warn!(cart_id = %cart.id, coupon = %code, error = %e, "Applied coupon no longer valid");
                Ok(None)
            }
        }
    }
}
