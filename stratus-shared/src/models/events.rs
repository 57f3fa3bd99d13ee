use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event names published by the billing core. Webhook configs subscribe to
/// these, or to [`WILDCARD`].
pub mod event_types {
    pub const WILDCARD: &str = "*";

    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_ACTIVATED: &str = "order.activated";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const INVOICE_PAID: &str = "invoice.paid";
    pub const CREDIT_ADDED: &str = "credit.added";
    pub const REFUND_ISSUED: &str = "refund.issued";
    pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
    pub const SUBSCRIPTION_CANCELLED: &str = "subscription.cancelled";
    pub const SERVICE_RENEWED: &str = "service.renewed";
    pub const SERVICE_SUSPENDED: &str = "service.suspended";
    pub const SERVICE_UNSUSPENDED: &str = "service.unsuspended";
    pub const SERVICE_TERMINATED: &str = "service.terminated";
}

pub use event_types::WILDCARD;

/// Envelope handed to event subscribers (webhook dispatcher, email outbox).
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event_type: String,
    pub customer_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(event_type: &str, customer_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            customer_id,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// JSON body sent to webhook endpoints.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "event": self.event_type,
            "created_at": self.occurred_at.to_rfc3339(),
            "data": self.payload,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmailJob {
    pub template: String,
    pub customer_id: Uuid,
    pub context: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}
