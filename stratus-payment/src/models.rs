use rust_decimal::Decimal;
use serde::Deserialize;
use stratus_core::BillingCycle;
use uuid::Uuid;

/// Input for starting a gateway charge.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPaymentRequest {
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub gateway_id: Uuid,
    /// Defaults to the invoice balance when an invoice is given.
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub payment_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub customer_id: Uuid,
    pub gateway_id: Uuid,
    pub service_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub payment_token: Option<String>,
}
