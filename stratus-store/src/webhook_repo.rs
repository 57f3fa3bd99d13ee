use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratus_core::models::{WebhookConfig, WebhookDelivery};
use stratus_core::repository::WebhookRepository;
use stratus_core::CoreResult;
use stratus_shared::models::events::WILDCARD;
use uuid::Uuid;

use crate::database::{db_err, PgStore};
use crate::rows::WebhookRow;

#[async_trait]
impl WebhookRepository for PgStore {
    async fn list_active_webhooks(&self, event_type: &str) -> CoreResult<Vec<WebhookConfig>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            r#"
            SELECT id, customer_id, url, secret, events, is_active, retry_attempts, timeout_seconds,
                   failure_count, last_triggered, created_at
            FROM webhooks
            WHERE is_active AND ($1 = ANY(events) OR $2 = ANY(events))
            ORDER BY created_at
            "#,
        )
        .bind(event_type)
        .bind(WILDCARD)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(WebhookConfig::from).collect())
    }

    async fn create_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, event_id, event_type, payload, attempts,
                                            last_status_code, last_response_ms, last_error, status,
                                            created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.webhook_id)
        .bind(delivery.event_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(delivery.attempts as i32)
        .bind(delivery.last_status_code.map(i32::from))
        .bind(delivery.last_response_ms.map(|ms| ms as i64))
        .bind(&delivery.last_error)
        .bind(delivery.status.as_str())
        .bind(delivery.created_at)
        .bind(delivery.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempts = $2, last_status_code = $3, last_response_ms = $4, last_error = $5,
                status = $6, completed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.attempts as i32)
        .bind(delivery.last_status_code.map(i32::from))
        .bind(delivery.last_response_ms.map(|ms| ms as i64))
        .bind(&delivery.last_error)
        .bind(delivery.status.as_str())
        .bind(delivery.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_webhook_triggered(&self, webhook_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE webhooks SET last_triggered = $2 WHERE id = $1")
            .bind(webhook_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_webhook_failures(&self, webhook_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE webhooks SET failure_count = failure_count + 1 WHERE id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
