use chrono::Utc;
use redis::{AsyncCommands, RedisResult};
use stratus_core::EventPublisher;
use stratus_shared::models::events::{event_types, DomainEvent, EmailJob};
use tracing::{debug, error, warn};

pub const EMAIL_OUTBOX_KEY: &str = "email:outbox";

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn push_email_job(&self, body: String) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(EMAIL_OUTBOX_KEY, body).await
    }
}

/// Template name for events that notify the customer by email.
pub fn email_template(event_type: &str) -> Option<&'static str> {
    match event_type {
        event_types::ORDER_CREATED => Some("order_confirmation"),
        event_types::ORDER_ACTIVATED => Some("service_welcome"),
        event_types::INVOICE_PAID => Some("invoice_payment_confirmation"),
        event_types::PAYMENT_FAILED => Some("payment_failed"),
        event_types::REFUND_ISSUED => Some("refund_confirmation"),
        event_types::CREDIT_ADDED => Some("credit_added"),
        event_types::SERVICE_SUSPENDED => Some("service_suspended"),
        event_types::SERVICE_TERMINATED => Some("service_terminated"),
        event_types::SUBSCRIPTION_CANCELLED => Some("subscription_cancelled"),
        _ => None,
    }
}

pub fn email_job_for(event: &DomainEvent) -> Option<EmailJob> {
    let template = email_template(&event.event_type)?;
    let customer_id = event.customer_id?;
    Some(EmailJob {
        template: template.to_string(),
        customer_id,
        context: event.payload.clone(),
        queued_at: Utc::now(),
    })
}

/// Turns customer-facing domain events into jobs on the Redis email list.
/// The push runs on a spawned task so publishers never wait on Redis.
#[derive(Clone)]
pub struct EmailOutbox {
    redis: RedisClient,
}

impl EmailOutbox {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

impl EventPublisher for EmailOutbox {
    fn publish(&self, event: DomainEvent) {
        let Some(job) = email_job_for(&event) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(event_type = %event.event_type, "No runtime for email outbox, job dropped");
            return;
        };
        let body = match serde_json::to_string(&job) {
            Ok(body) => body,
            Err(e) => {
                error!(template = %job.template, error = %e, "Failed to encode email job");
                return;
            }
        };
        let redis = self.redis.clone();
        handle.spawn(async move {
            match redis.push_email_job(body).await {
                Ok(()) => debug!(template = %job.template, customer_id = %job.customer_id, "Email job queued"),
                Err(e) => error!(template = %job.template, error = %e, "Failed to queue email job"),
            }
        });
    }
}
