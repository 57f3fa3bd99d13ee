pub mod manual;
pub mod models;
pub mod service;

pub use manual::ManualGateway;
pub use models::{NewPaymentRequest, NewSubscription};
pub use service::PaymentService;
