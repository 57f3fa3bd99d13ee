pub mod models;
pub mod service;

pub use models::{AddItemRequest, CartSummary};
pub use service::CartService;
