use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use stratus_core::events::EventPublisher;
use stratus_core::models::{Service, ServiceStatus};
use stratus_core::repository::OrderRepository;
use stratus_core::{BillingCycle, CoreError, CoreResult};
use stratus_shared::models::events::event_types;
use stratus_shared::DomainEvent;
use tracing::info;
use uuid::Uuid;

/// Next due date after a renewal. A lapsed service restarts its period from
/// `now`; one renewed early keeps its anniversary.
pub fn next_due_after_renewal(current_due: DateTime<Utc>, cycle: BillingCycle, now: DateTime<Utc>) -> DateTime<Utc> {
    if current_due < now {
        cycle.advance(now)
    } else {
        cycle.advance(current_due)
    }
}

/// Status changes and renewals of provisioned services.
pub struct ServiceManager {
    orders: Arc<dyn OrderRepository>,
    events: Arc<dyn EventPublisher>,
}

impl ServiceManager {
    pub fn new(orders: Arc<dyn OrderRepository>, events: Arc<dyn EventPublisher>) -> Self {
        Self { orders, events }
    }

    pub async fn get_service(&self, service_id: Uuid) -> CoreResult<Service> {
        self.orders
            .get_service(service_id)
            .await?
            .ok_or_else(|| CoreError::not_found("service", service_id))
    }

    pub async fn mark_active(&self, service_id: Uuid) -> CoreResult<Service> {
        self.transition(service_id, &[ServiceStatus::Pending], ServiceStatus::Active, None)
            .await
    }

    pub async fn suspend(&self, service_id: Uuid) -> CoreResult<Service> {
        self.transition(
            service_id,
            &[ServiceStatus::Active],
            ServiceStatus::Suspended,
            Some(event_types::SERVICE_SUSPENDED),
        )
        .await
    }

    pub async fn unsuspend(&self, service_id: Uuid) -> CoreResult<Service> {
        self.transition(
            service_id,
            &[ServiceStatus::Suspended],
            ServiceStatus::Active,
            Some(event_types::SERVICE_UNSUSPENDED),
        )
        .await
    }

    pub async fn terminate(&self, service_id: Uuid) -> CoreResult<Service> {
        self.transition(
            service_id,
            &[ServiceStatus::Pending, ServiceStatus::Active, ServiceStatus::Suspended],
            ServiceStatus::Terminated,
            Some(event_types::SERVICE_TERMINATED),
        )
        .await
    }

    /// Push the next due date forward by one billing period.
    pub async fn renew(&self, service_id: Uuid) -> CoreResult<Service> {
        let service = self
            .orders
            .update_service(
                service_id,
                Box::new(|mut service: Service| {
                    if service.status == ServiceStatus::Terminated {
                        return Err(CoreError::InvalidTransition {
                            from: service.status.to_string(),
                            to: "renewed".to_string(),
                        });
                    }
                    let now = Utc::now();
                    service.next_due_date = next_due_after_renewal(service.next_due_date, service.billing_cycle, now);
                    service.updated_at = now;
                    Ok(service)
                }),
            )
            .await?;

        info!(
            service_id = %service.id,
            next_due = %service.next_due_date,
            "Service renewed"
        );
        self.events.publish(DomainEvent::new(
            event_types::SERVICE_RENEWED,
            Some(service.customer_id),
            json!({
                "service_id": service.id,
                "next_due_date": service.next_due_date.to_rfc3339(),
            }),
        ));
        Ok(service)
    }

    /// `allowed_from` is checked against the locked row.
    async fn transition(
        &self,
        service_id: Uuid,
        allowed_from: &[ServiceStatus],
        to: ServiceStatus,
        event: Option<&str>,
    ) -> CoreResult<Service> {
        let allowed_from = allowed_from.to_vec();
        let service = self
            .orders
            .update_service(
                service_id,
                Box::new(move |mut service: Service| {
                    if !allowed_from.contains(&service.status) {
                        return Err(CoreError::InvalidTransition {
                            from: service.status.to_string(),
                            to: to.to_string(),
                        });
                    }
                    let now = Utc::now();
                    service.status = to;
                    service.updated_at = now;
                    if to == ServiceStatus::Terminated {
                        service.terminated_at = Some(now);
                    }
                    Ok(service)
                }),
            )
            .await?;

        info!(service_id = %service.id, status = %service.status, "Service status changed");
        if let Some(event_type) = event {
            self.events.publish(DomainEvent::new(
                event_type,
                Some(service.customer_id),
                json!({ "service_id": service.id, "status": service.status.as_str() }),
            ));
        }
        Ok(service)
    }
}
