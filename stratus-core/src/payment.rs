use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stratus_shared::Masked;
use uuid::Uuid;

use crate::billing_cycle::BillingCycle;
use crate::models::{Gateway, PaymentRequest, PaymentSubscription, Transaction};
use crate::{CoreError, CoreResult};

/// Outcome status reported by a processor for an accepted charge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Succeeded,
    Processing,
    RequiresAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeResult {
    pub gateway_reference: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResult {
    pub gateway_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub payment_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResult {
    pub gateway_subscription_id: String,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardDetails {
    pub number: Masked<String>,
    pub exp_month: u32,
    pub exp_year: i32,
    pub cvc: Masked<String>,
    pub holder_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Payment declined: {0}")]
    Declined(String),
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid gateway request: {0}")]
    InvalidRequest(String),
    #[error("Operation not supported by gateway: {0}")]
    Unsupported(&'static str),
}

impl From<GatewayError> for CoreError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unsupported(_) => CoreError::ConfigurationError(err.to_string()),
            other => CoreError::GatewayError(other.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Capability interface every payment processor implements. The stored
/// `Gateway` record is passed in so one implementation can serve several
/// configured accounts.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge the amount described by a payment request
    async fn process_payment(&self, gateway: &Gateway, request: &PaymentRequest) -> GatewayResult<ChargeResult>;

    /// Refund part or all of a captured payment
    async fn process_refund(
        &self,
        gateway: &Gateway,
        transaction: &Transaction,
        amount: Decimal,
    ) -> GatewayResult<RefundResult>;

    async fn create_subscription(
        &self,
        gateway: &Gateway,
        request: &SubscriptionRequest,
    ) -> GatewayResult<SubscriptionResult>;

    async fn cancel_subscription(
        &self,
        gateway: &Gateway,
        subscription: &PaymentSubscription,
        immediately: bool,
    ) -> GatewayResult<()>;

    /// Verify an inbound notification really came from the processor
    fn validate_webhook(&self, gateway: &Gateway, payload: &[u8], signature: &str) -> bool;

    async fn tokenize_card(&self, gateway: &Gateway, card: &CardDetails) -> GatewayResult<String>;

    /// Hosted payment page for redirect-style processors, if any
    async fn get_payment_url(&self, gateway: &Gateway, request: &PaymentRequest) -> GatewayResult<Option<String>>;
}

/// Slug → processor map, built once at startup and injected into the payment
/// service.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    processors: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, slug: &str, processor: Arc<dyn PaymentGateway>) {
        if self.processors.insert(slug.to_string(), processor).is_some() {
            tracing::warn!(slug = %slug, "Replacing previously registered payment processor");
        }
    }

    pub fn with(mut self, slug: &str, processor: Arc<dyn PaymentGateway>) -> Self {
        self.register(slug, processor);
        self
    }

    /// Processor for a stored gateway. Inactive gateways and unregistered
    /// slugs are configuration errors.
    pub fn resolve(&self, gateway: &Gateway) -> CoreResult<Arc<dyn PaymentGateway>> {
        if !gateway.is_active {
            return Err(CoreError::ConfigurationError(format!("gateway '{}' is inactive", gateway.slug)));
        }
        self.processors.get(&gateway.slug).cloned().ok_or_else(|| {
            CoreError::ConfigurationError(format!("no processor registered for gateway '{}'", gateway.slug))
        })
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.processors.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}
