use async_trait::async_trait;
use rust_decimal::Decimal;
use stratus_core::models::{Gateway, PaymentRequest, PaymentSubscription, Transaction};
use stratus_core::payment::{
    CardDetails, ChargeResult, GatewayError, GatewayResult, PaymentGateway, PaymentStatus, RefundResult,
    SubscriptionRequest, SubscriptionResult,
};
use stratus_webhook::verify_signature;
use uuid::Uuid;

pub const MANUAL_SLUG: &str = "manual";

/// Offline processor for bank transfers and cheques recorded by staff.
/// Charges settle immediately. Inbound notifications are signed with the
/// gateway's `webhook_secret` setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualGateway;

fn reference(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[async_trait]
impl PaymentGateway for ManualGateway {
    async fn process_payment(&self, _gateway: &Gateway, request: &PaymentRequest) -> GatewayResult<ChargeResult> {
        Ok(ChargeResult {
            gateway_reference: request.payment_token.clone().unwrap_or_else(|| reference("MAN")),
            amount: request.amount,
            fee: Decimal::ZERO,
            status: PaymentStatus::Succeeded,
        })
    }

    async fn process_refund(&self, _gateway: &Gateway, _transaction: &Transaction, _amount: Decimal) -> GatewayResult<RefundResult> {
        Ok(RefundResult {
            gateway_reference: reference("MANREF"),
        })
    }

    async fn create_subscription(&self, _gateway: &Gateway, _request: &SubscriptionRequest) -> GatewayResult<SubscriptionResult> {
        Err(GatewayError::Unsupported("recurring payments"))
    }

    async fn cancel_subscription(&self, _gateway: &Gateway, _subscription: &PaymentSubscription, _immediately: bool) -> GatewayResult<()> {
        Err(GatewayError::Unsupported("recurring payments"))
    }

    fn validate_webhook(&self, gateway: &Gateway, payload: &[u8], signature: &str) -> bool {
        match gateway.settings.get("webhook_secret").and_then(|v| v.as_str()) {
            Some(secret) if !secret.is_empty() => verify_signature(secret, payload, signature),
            _ => false,
        }
    }

    async fn tokenize_card(&self, _gateway: &Gateway, _card: &CardDetails) -> GatewayResult<String> {
        Err(GatewayError::Unsupported("card tokenization"))
    }

    async fn get_payment_url(&self, gateway: &Gateway, _request: &PaymentRequest) -> GatewayResult<Option<String>> {
        Ok(gateway
            .settings
            .get("instructions_url")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }
}
