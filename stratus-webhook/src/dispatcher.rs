//! Outbound webhook delivery.
//!
//! [`WebhookDeliverer`] performs one delivery with bounded retries and
//! quadratic backoff. [`WebhookDispatcher`] is the event-publisher side: it
//! queues events without blocking and fans each one out to the subscribed
//! webhooks, with at most `max_concurrent` deliveries in flight.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::events::EventPublisher;
use stratus_core::models::{DeliveryStatus, WebhookConfig, WebhookDelivery};
use stratus_core::repository::WebhookRepository;
use stratus_core::{CoreError, CoreResult};
use stratus_shared::DomainEvent;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::signing::{sign_payload, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use crate::transport::{WebhookRequest, WebhookTransport};

/// Wait before the attempt following failed attempt `attempt` (1-based).
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit * attempt.saturating_mul(attempt)
}

pub struct WebhookDeliverer {
    repo: Arc<dyn WebhookRepository>,
    transport: Arc<dyn WebhookTransport>,
    backoff_unit: Duration,
}

impl WebhookDeliverer {
    pub fn new(repo: Arc<dyn WebhookRepository>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            repo,
            transport,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Deliver `event` to every active webhook subscribed to it, concurrently,
    /// and wait for all of them.
    pub async fn trigger(this: &Arc<Self>, event: &DomainEvent) -> CoreResult<Vec<WebhookDelivery>> {
        let mut tasks = Self::spawn_deliveries(this, event, None).await?;

        let mut deliveries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let delivery = joined.map_err(|e| CoreError::InternalError(format!("delivery task failed: {}", e)))??;
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    /// One task per subscribed webhook. With `permits`, each task holds a
    /// permit for its whole delivery and spawning waits for a free one.
    async fn spawn_deliveries(
        this: &Arc<Self>,
        event: &DomainEvent,
        permits: Option<&Arc<Semaphore>>,
    ) -> CoreResult<JoinSet<CoreResult<WebhookDelivery>>> {
        let webhooks = this.repo.list_active_webhooks(&event.event_type).await?;
        let mut tasks = JoinSet::new();
        for webhook in webhooks {
            let permit = match permits {
                Some(permits) => Some(
                    Arc::clone(permits)
                        .acquire_owned()
                        .await
                        .map_err(|e| CoreError::InternalError(format!("delivery permits closed: {}", e)))?,
                ),
                None => None,
            };
            let deliverer = Arc::clone(this);
            let event = event.clone();
            tasks.spawn(async move {
                let _permit = permit;
                deliverer.deliver(&webhook, &event).await
            });
        }
        Ok(tasks)
    }

    /// Bookkeeping writes never cut a delivery short; a failed write is logged.
    async fn save(&self, delivery: &WebhookDelivery) {
        if let Err(e) = self.repo.update_delivery(delivery).await {
            error!(delivery_id = %delivery.id, attempts = delivery.attempts, error = %e, "Failed to record webhook attempt");
        }
    }

    /// One delivery: up to `retry_attempts` POSTs (at least one), sleeping
    /// k² backoff units after failed attempt k. Only 2xx counts as success.
    pub async fn deliver(&self, webhook: &WebhookConfig, event: &DomainEvent) -> CoreResult<WebhookDelivery> {
        let body = event.to_body();
        let bytes = serde_json::to_vec(&body).map_err(|e| CoreError::InternalError(e.to_string()))?;

        let mut delivery = WebhookDelivery::new(webhook.id, event.id, &event.event_type, body);
        self.repo.create_delivery(&delivery).await?;

        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            (EVENT_HEADER, event.event_type.clone()),
            (DELIVERY_HEADER, delivery.id.to_string()),
        ];
        if let Some(secret) = &webhook.secret {
            headers.push((SIGNATURE_HEADER, sign_payload(secret.expose(), &bytes)?));
        }
        let request = WebhookRequest {
            url: webhook.url.clone(),
            headers,
            body: bytes,
            timeout: Duration::from_secs(webhook.timeout_seconds.max(1)),
        };

        let max_attempts = webhook.retry_attempts.max(1);
        for attempt in 1..=max_attempts {
            delivery.attempts = attempt;

            match self.transport.send(&request).await {
                Ok(response) => {
                    delivery.last_status_code = Some(response.status);
                    delivery.last_response_ms = Some(response.elapsed.as_millis() as u64);
                    if response.is_success() {
                        let now = Utc::now();
                        delivery.status = DeliveryStatus::Success;
                        delivery.last_error = None;
                        delivery.completed_at = Some(now);
                        self.save(&delivery).await;
                        if let Err(e) = self.repo.mark_webhook_triggered(webhook.id, now).await {
                            error!(webhook_id = %webhook.id, error = %e, "Failed to record webhook trigger time");
                        }
                        info!(
                            webhook_id = %webhook.id,
                            delivery_id = %delivery.id,
                            event = %event.event_type,
                            attempt,
                            "Webhook delivered"
                        );
                        return Ok(delivery);
                    }
                    delivery.last_error = Some(format!("HTTP {}", response.status));
                }
                Err(e) => {
                    delivery.last_status_code = None;
                    delivery.last_response_ms = None;
                    delivery.last_error = Some(e.to_string());
                }
            }

            warn!(
                webhook_id = %webhook.id,
                delivery_id = %delivery.id,
                attempt,
                max_attempts,
                error = delivery.last_error.as_deref().unwrap_or_default(),
                "Webhook attempt failed"
            );

            if attempt < max_attempts {
                self.save(&delivery).await;
                tokio::time::sleep(backoff_delay(self.backoff_unit, attempt)).await;
            }
        }

        delivery.status = DeliveryStatus::Failed;
        delivery.completed_at = Some(Utc::now());
        self.save(&delivery).await;
        if let Err(e) = self.repo.increment_webhook_failures(webhook.id).await {
            error!(webhook_id = %webhook.id, error = %e, "Failed to count webhook failure");
        }
        error!(
            webhook_id = %webhook.id,
            delivery_id = %delivery.id,
            attempts = delivery.attempts,
            "Webhook delivery failed"
        );
        Ok(delivery)
    }
}

/// Queue-backed publisher feeding a single dispatcher task.
#[derive(Clone)]
pub struct WebhookDispatcher {
    sender: mpsc::Sender<DomainEvent>,
}

impl WebhookDispatcher {
    /// Start the dispatcher task on the current runtime.
    pub fn spawn(deliverer: Arc<WebhookDeliverer>, queue_capacity: usize, max_concurrent: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(run_dispatcher(deliverer, receiver, max_concurrent.max(1)));
        (Self { sender }, handle)
    }
}

impl EventPublisher for WebhookDispatcher {
    fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.sender.try_send(event) {
            let dropped = match &e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => event,
            };
            error!(
                event_id = %dropped.id,
                event = %dropped.event_type,
                error = %e,
                "Webhook queue rejected event"
            );
        }
    }
}

async fn run_dispatcher(deliverer: Arc<WebhookDeliverer>, mut receiver: mpsc::Receiver<DomainEvent>, max_concurrent: usize) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    info!(max_concurrent, "Webhook dispatcher started");

    while let Some(event) = receiver.recv().await {
        // Waiting for permits here pushes back on the queue once the cap is reached.
        let mut tasks = match WebhookDeliverer::spawn_deliveries(&deliverer, &event, Some(&permits)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(event = %event.event_type, error = %e, "Failed to fan out event");
                continue;
            }
        };
        tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(event_id = %event.id, error = %e, "Webhook delivery aborted"),
                    Err(e) => error!(event_id = %event.id, error = %e, "Webhook delivery task failed"),
                }
            }
        });
    }
    info!("Webhook dispatcher stopped");
}
