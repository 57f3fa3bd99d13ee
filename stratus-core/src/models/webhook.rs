use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_shared::models::events::WILDCARD;
use stratus_shared::Masked;
use uuid::Uuid;

use super::text_enum;

/// A customer's (or the system's, when `customer_id` is None) subscription to
/// outbound event notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub url: String,
    pub secret: Option<Masked<String>>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub failure_count: i64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(url: &str, events: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: None,
            url: url.to_string(),
            secret: None,
            events: events.iter().map(|e| e.to_string()).collect(),
            is_active: true,
            retry_attempts: 3,
            timeout_seconds: 10,
            failure_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type || e == WILDCARD)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

text_enum!(DeliveryStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
});

/// One delivery of one event to one webhook, across all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_response_ms: Option<u64>,
    pub last_error: Option<String>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn new(webhook_id: Uuid, event_id: Uuid, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            event_id,
            event_type: event_type.to_string(),
            payload,
            attempts: 0,
            last_status_code: None,
            last_response_ms: None,
            last_error: None,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
