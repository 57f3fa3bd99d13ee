use async_trait::async_trait;
use std::time::{Duration, Instant};
use stratus_core::CoreError;

/// One outbound POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WebhookResponse {
    pub status: u16,
    pub elapsed: Duration,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Connection(String),
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        CoreError::WebhookError(err.to_string())
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

/// HTTP transport over a shared `reqwest` client.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Caps the connect phase; each request still carries its webhook's own
    /// overall timeout.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default webhook HTTP client");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let started = Instant::now();
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        match builder.send().await {
            Ok(response) => Ok(WebhookResponse {
                status: response.status().as_u16(),
                elapsed: started.elapsed(),
            }),
            Err(e) if e.is_timeout() => Err(TransportError::Timeout(request.timeout)),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }
}
