pub mod app_config;
pub mod billing_repo;
pub mod cart_repo;
pub mod catalog_repo;
pub mod customer_repo;
pub mod database;
pub mod order_repo;
pub mod redis_repo;
mod rows;
pub mod webhook_repo;

pub use app_config::Config;
pub use database::{DbClient, PgStore};
pub use redis_repo::{EmailOutbox, RedisClient};
