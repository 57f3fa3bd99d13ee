use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stratus_core::models::{
    CreditAdjustment, GatewayWebhookLog, Invoice, PaymentRequest, PaymentSubscription, Transaction,
};
use stratus_core::payment::CardDetails;
use stratus_payment::{NewPaymentRequest, NewSubscription};
use stratus_webhook::signing::SIGNATURE_HEADER;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    pub request: PaymentRequest,
    pub transaction: Transaction,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Serialize)]
pub struct CreditPaymentResponse {
    pub adjustment: CreditAdjustment,
    pub transaction: Transaction,
    pub invoice: Invoice,
}

#[derive(Debug, Deserialize)]
pub struct AddCreditRequest {
    pub amount: Decimal,
    pub currency: Option<String>,
    pub reason: String,
    pub staff_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PayWithCreditRequest {
    pub customer_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub reason: String,
    pub staff_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default)]
    pub immediately: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payment-requests", post(create_payment_request))
        .route("/v1/payment-requests/{id}", get(get_payment_request))
        .route("/v1/payment-requests/{id}/process", post(process_payment))
        .route("/v1/payment-requests/{id}/url", get(get_payment_url))
        .route("/v1/gateways/{id}/tokens", post(tokenize_card))
        .route("/v1/customers/{id}/credit", post(add_credit).get(credit_history))
        .route("/v1/invoices/{id}/pay-with-credit", post(pay_with_credit))
        .route("/v1/transactions/{id}/refunds", post(process_refund))
        .route("/v1/transactions/{id}/refundable", get(remaining_refundable))
        .route("/v1/subscriptions", post(create_subscription))
        .route("/v1/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/v1/webhooks/gateways/{slug}", post(gateway_webhook))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/payment-requests
pub async fn create_payment_request(
    State(state): State<AppState>,
    Json(req): Json<NewPaymentRequest>,
) -> ApiResult<(StatusCode, Json<PaymentRequest>)> {
    let request = state.payments.create_payment_request(req).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /v1/payment-requests/:id
pub async fn get_payment_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<PaymentRequest>> {
    Ok(Json(state.payments.get_payment_request(request_id).await?))
}

/// POST /v1/payment-requests/:id/process
/// Charge through the gateway; on success the invoice is settled
pub async fn process_payment(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<SettlementResponse>> {
    let settlement = state.payments.process_payment(request_id).await?;
    Ok(Json(SettlementResponse {
        request: settlement.request,
        transaction: settlement.transaction,
        invoice: settlement.invoice,
    }))
}

/// GET /v1/payment-requests/:id/url
/// Hosted payment page, for gateways that redirect
pub async fn get_payment_url(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = state.payments.get_payment_url(request_id).await?;
    Ok(Json(json!({ "url": url })))
}

/// POST /v1/gateways/:id/tokens
pub async fn tokenize_card(
    State(state): State<AppState>,
    Path(gateway_id): Path<Uuid>,
    Json(card): Json<CardDetails>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let token = state.payments.tokenize_card(gateway_id, &card).await?;
    Ok((StatusCode::CREATED, Json(json!({ "token": token }))))
}

/// POST /v1/customers/:id/credit
pub async fn add_credit(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<AddCreditRequest>,
) -> ApiResult<(StatusCode, Json<CreditAdjustment>)> {
    let currency = req.currency.unwrap_or_else(|| state.settings.default_currency.clone());
    let adjustment = state
        .payments
        .add_credit(customer_id, req.amount, &currency, &req.reason, req.staff_id)
        .await?;
    Ok((StatusCode::CREATED, Json(adjustment)))
}

/// GET /v1/customers/:id/credit
/// Newest adjustment first
pub async fn credit_history(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CreditAdjustment>>> {
    Ok(Json(state.payments.get_credit_history(customer_id).await?))
}

/// POST /v1/invoices/:id/pay-with-credit
pub async fn pay_with_credit(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(req): Json<PayWithCreditRequest>,
) -> ApiResult<Json<CreditPaymentResponse>> {
    let payment = state
        .payments
        .pay_with_credit(req.customer_id, invoice_id, req.amount)
        .await?;
    Ok(Json(CreditPaymentResponse {
        adjustment: payment.adjustment,
        transaction: payment.transaction,
        invoice: payment.invoice,
    }))
}

/// POST /v1/transactions/:id/refunds
pub async fn process_refund(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let refund = state
        .payments
        .process_refund(transaction_id, req.amount, &req.reason, req.staff_id)
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

/// GET /v1/transactions/:id/refundable
pub async fn remaining_refundable(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let remaining = state.payments.remaining_refundable(transaction_id).await?;
    Ok(Json(json!({ "transaction_id": transaction_id, "remaining": remaining })))
}

/// POST /v1/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<PaymentSubscription>)> {
    let subscription = state.payments.create_subscription(req).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// POST /v1/subscriptions/:id/cancel
/// Body is optional; defaults to cancelling at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<PaymentSubscription>> {
    let req: CancelSubscriptionRequest = if body.is_empty() {
        CancelSubscriptionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::ValidationError(e.to_string()))?
    };
    Ok(Json(
        state
            .payments
            .cancel_subscription(subscription_id, req.immediately)
            .await?,
    ))
}

/// POST /v1/webhooks/gateways/:slug
/// Inbound processor notification; the raw body is what gets verified
pub async fn gateway_webhook(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<GatewayWebhookLog>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    Ok(Json(state.payments.process_webhook(&slug, &body, signature).await?))
}
