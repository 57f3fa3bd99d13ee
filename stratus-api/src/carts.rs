use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use stratus_cart::{AddItemRequest, CartSummary};
use stratus_core::models::{Cart, CartItem, CartOwner};
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Exactly one of `customer_id` / `session_id`.
#[derive(Debug, Deserialize)]
pub struct CreateCartRequest {
    pub customer_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct ApplyCouponRequest {
    pub code: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/carts", post(create_cart))
        .route("/v1/carts/{id}", get(get_cart_summary))
        .route("/v1/carts/{id}/items", post(add_item))
        .route("/v1/carts/{id}/coupon", post(apply_coupon).delete(remove_coupon))
        .route("/v1/cart-items/{id}", patch(update_item).delete(remove_item))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/carts
pub async fn create_cart(
    State(state): State<AppState>,
    Json(req): Json<CreateCartRequest>,
) -> ApiResult<(StatusCode, Json<Cart>)> {
    let owner = match (req.customer_id, req.session_id) {
        (Some(customer_id), None) => CartOwner::Customer(customer_id),
        (None, Some(session_id)) => CartOwner::Session(session_id),
        _ => {
            return Err(AppError::ValidationError(
                "exactly one of customer_id or session_id is required".to_string(),
            ))
        }
    };
    let currency = req.currency.unwrap_or_else(|| state.settings.default_currency.clone());

    let cart = state.carts.create_cart(owner, &currency).await?;
    Ok((StatusCode::CREATED, Json(cart)))
}

/// GET /v1/carts/:id
/// Priced view of the cart, recomputed on every read
pub async fn get_cart_summary(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> ApiResult<Json<CartSummary>> {
    Ok(Json(state.carts.get_cart_summary(cart_id).await?))
}

/// POST /v1/carts/:id/items
pub async fn add_item(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(req): Json<AddItemRequest>,
) -> ApiResult<(StatusCode, Json<CartItem>)> {
    let item = state.carts.add_item(cart_id, req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// PATCH /v1/cart-items/:id
/// Quantity 0 removes the line and answers 204
pub async fn update_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Json(req): Json<UpdateItemRequest>,
) -> ApiResult<Response> {
    match state.carts.update_item(item_id, req.quantity).await? {
        Some(item) => Ok(Json(item).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// DELETE /v1/cart-items/:id
pub async fn remove_item(State(state): State<AppState>, Path(item_id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.carts.remove_item(item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/carts/:id/coupon
pub async fn apply_coupon(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(req): Json<ApplyCouponRequest>,
) -> ApiResult<Json<CartSummary>> {
    Ok(Json(state.carts.apply_coupon(cart_id, &req.code).await?))
}

/// DELETE /v1/carts/:id/coupon
pub async fn remove_coupon(State(state): State<AppState>, Path(cart_id): Path<Uuid>) -> ApiResult<Json<CartSummary>> {
    Ok(Json(state.carts.remove_coupon(cart_id).await?))
}
