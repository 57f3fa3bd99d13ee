pub mod dispatcher;
pub mod signing;
pub mod transport;

pub use dispatcher::{WebhookDeliverer, WebhookDispatcher};
pub use signing::{sign_payload, verify_signature};
pub use transport::{ReqwestTransport, TransportError, WebhookRequest, WebhookResponse, WebhookTransport};
