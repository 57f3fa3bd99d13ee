pub mod lifecycle;
pub mod manager;
pub mod number;

pub use lifecycle::{next_due_after_renewal, ServiceManager};
pub use manager::OrderManager;
pub use number::OrderNumberGenerator;
