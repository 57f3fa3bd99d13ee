use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use stratus_core::CoreError;
use tracing::info;

use crate::app_config::DatabaseConfig;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// Postgres implementation of every repository trait. Plan-closure methods
/// run inside one transaction with the hot rows locked `FOR UPDATE`.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn db_err(e: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return CoreError::Conflict(db.message().to_string());
        }
    }
    CoreError::StorageError(e.to_string())
}

