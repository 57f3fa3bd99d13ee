pub mod money;
pub mod pii;
pub mod models;

pub use money::{round_money, Currency};
pub use pii::Masked;
pub use models::events::DomainEvent;
