use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stratus_api::{app, AppSettings, AppState};
use stratus_core::events::{EventPublisher, FanoutPublisher};
use stratus_core::models::Gateway;
use stratus_core::payment::GatewayRegistry;
use stratus_core::repository::WebhookRepository;
use stratus_core::MemoryStore;
use stratus_payment::manual::{ManualGateway, MANUAL_SLUG};
use stratus_store::{Config, DbClient, EmailOutbox, RedisClient};
use stratus_webhook::{ReqwestTransport, WebhookDeliverer, WebhookDispatcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Stratus API on port {}", config.server.port);

    let registry = GatewayRegistry::new().with(MANUAL_SLUG, Arc::new(ManualGateway));
    let settings = AppSettings {
        default_currency: config.billing.default_currency.clone(),
        payment_request_ttl: chrono::Duration::seconds(config.billing.payment_request_ttl_seconds),
    };

    let app_state = if config.database.url.is_empty() {
        tracing::warn!("No database configured, running on the in-memory store");
        let store = Arc::new(MemoryStore::new());
        store.insert_gateway(Gateway::new("Bank Transfer", MANUAL_SLUG)).await;
        let events = publishers(&config, store.clone()).await?;
        AppState::new(store, registry, events, settings)
    } else {
        let db = DbClient::new(&config.database)
            .await
            .context("Failed to connect to Postgres")?;
        db.migrate().await.context("Failed to run migrations")?;
        let store = Arc::new(db.store());
        let events = publishers(&config, store.clone()).await?;
        AppState::new(store, registry, events, settings)
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Webhook dispatcher plus, when Redis is configured, the email outbox.
async fn publishers(config: &Config, webhooks: Arc<dyn WebhookRepository>) -> anyhow::Result<Arc<dyn EventPublisher>> {
    let transport = ReqwestTransport::with_connect_timeout(Duration::from_secs(config.webhooks.default_timeout_seconds.max(1)));
    let deliverer = Arc::new(WebhookDeliverer::new(webhooks, Arc::new(transport)));
    let (dispatcher, _worker) = WebhookDispatcher::spawn(
        deliverer,
        config.webhooks.queue_capacity,
        config.webhooks.max_concurrent_deliveries,
    );

    let mut sinks: Vec<Arc<dyn EventPublisher>> = vec![Arc::new(dispatcher)];
    if config.redis.url.is_empty() {
        tracing::warn!("No Redis configured, customer emails are not queued");
    } else {
        let redis = RedisClient::new(&config.redis.url)
            .await
            .context("Failed to open Redis client")?;
        sinks.push(Arc::new(EmailOutbox::new(redis)));
    }

    Ok(Arc::new(FanoutPublisher::new(sinks)))
}
