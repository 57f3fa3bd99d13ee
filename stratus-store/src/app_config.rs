use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub billing: BillingConfig,
    pub webhooks: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Empty runs the API on the in-memory store.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Empty disables the email outbox.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    pub default_currency: String,
    pub payment_request_ttl_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub queue_capacity: usize,
    pub max_concurrent_deliveries: usize,
    pub default_timeout_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `STRATUS__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("STRATUS").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
