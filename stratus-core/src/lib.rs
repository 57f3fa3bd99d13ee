pub mod billing_cycle;
pub mod events;
pub mod memory;
pub mod models;
pub mod payment;
pub mod repository;
pub mod tax;

pub use billing_cycle::{add_billing_period, BillingCycle};
pub use events::{EventPublisher, NoopPublisher};
pub use memory::MemoryStore;
pub use tax::TaxCalculator;

use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("No pricing configured for product {0}")]
    PricingNotFound(Uuid),
    #[error("Billing cycle not available: {0}")]
    InvalidBillingCycle(String),
    #[error("Invalid coupon: {0}")]
    InvalidCoupon(String),
    #[error("Cart is empty: {0}")]
    CartEmpty(Uuid),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Insufficient credit balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Decimal, requested: Decimal },
    #[error("Transaction not refundable: {0}")]
    NotRefundable(Uuid),
    #[error("Refund of {requested} exceeds remaining refundable amount {remaining}")]
    RefundExceedsRemaining { remaining: Decimal, requested: Decimal },
    #[error("Payment request expired: {0}")]
    PaymentRequestExpired(Uuid),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Gateway error: {0}")]
    GatewayError(String),
    #[error("Webhook delivery failed: {0}")]
    WebhookError(String),
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

/// Coarse classification used by callers that only care how to report or
/// whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Configuration,
    External,
    Authentication,
    Internal,
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::ValidationError(_)
            | CoreError::PricingNotFound(_)
            | CoreError::InvalidBillingCycle(_)
            | CoreError::InvalidCoupon(_)
            | CoreError::CartEmpty(_)
            | CoreError::InvalidAmount(_) => ErrorKind::Validation,
            CoreError::InvalidTransition { .. }
            | CoreError::InsufficientBalance { .. }
            | CoreError::NotRefundable(_)
            | CoreError::RefundExceedsRemaining { .. }
            | CoreError::PaymentRequestExpired(_)
            | CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::ConfigurationError(_) => ErrorKind::Configuration,
            CoreError::GatewayError(_) | CoreError::WebhookError(_) => ErrorKind::External,
            CoreError::AuthenticationError(_) => ErrorKind::Authentication,
            CoreError::StorageError(_) | CoreError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Rejects zero and negative money amounts.
pub fn ensure_positive(amount: Decimal, what: &str) -> CoreResult<()> {
    if amount <= Decimal::ZERO {
        return Err(CoreError::InvalidAmount(format!("{} must be positive, got {}", what, amount)));
    }
    Ok(())
}
