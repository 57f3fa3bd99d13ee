use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use stratus_core::models::{Order, Service};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub cart_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub order: Order,
    pub services: Vec<Service>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders", post(create_order))
        .route("/v1/orders/{id}", get(get_order))
        .route("/v1/orders/{id}/activate", post(activate_order))
        .route("/v1/orders/{id}/cancel", post(cancel_order))
        .route("/v1/customers/{id}/orders", get(list_orders))
        .route("/v1/services/{id}", get(get_service))
        .route("/v1/services/{id}/activate", post(mark_service_active))
        .route("/v1/services/{id}/renew", post(renew_service))
        .route("/v1/services/{id}/suspend", post(suspend_service))
        .route("/v1/services/{id}/unsuspend", post(unsuspend_service))
        .route("/v1/services/{id}/terminate", post(terminate_service))
}

/// First hop of `X-Forwarded-For`, if present.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/orders
/// Check out a cart into a pending order and its invoice
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = state
        .orders
        .create_order(req.customer_id, req.cart_id, client_ip(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /v1/orders/:id
pub async fn get_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<Json<Order>> {
    Ok(Json(state.orders.get_order(order_id).await?))
}

/// GET /v1/customers/:id/orders
pub async fn list_orders(State(state): State<AppState>, Path(customer_id): Path<Uuid>) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(state.orders.list_orders(customer_id).await?))
}

/// POST /v1/orders/:id/activate
pub async fn activate_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<ActivationResponse>> {
    let activation = state.orders.activate_order(order_id).await?;
    Ok(Json(ActivationResponse {
        order: activation.order,
        services: activation.services,
    }))
}

/// POST /v1/orders/:id/cancel
pub async fn cancel_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<Json<Order>> {
    Ok(Json(state.orders.cancel_order(order_id).await?))
}

/// GET /v1/services/:id
pub async fn get_service(State(state): State<AppState>, Path(service_id): Path<Uuid>) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.get_service(service_id).await?))
}

/// POST /v1/services/:id/activate
pub async fn mark_service_active(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.mark_active(service_id).await?))
}

/// POST /v1/services/:id/renew
pub async fn renew_service(State(state): State<AppState>, Path(service_id): Path<Uuid>) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.renew(service_id).await?))
}

/// POST /v1/services/:id/suspend
pub async fn suspend_service(State(state): State<AppState>, Path(service_id): Path<Uuid>) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.suspend(service_id).await?))
}

/// POST /v1/services/:id/unsuspend
pub async fn unsuspend_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.unsuspend(service_id).await?))
}

/// POST /v1/services/:id/terminate
pub async fn terminate_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<Service>> {
    Ok(Json(state.services.terminate(service_id).await?))
}
