use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use tracing::info;

use super::{handle_ledger_error, ApiError};
use crate::models::cart::{Cart, CartValidation};
use crate::models::order::{CustomerInfo, Order};
use crate::services::Ledger;
use crate::types::ApiResponse;

type HandlerResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Create cart routes, keyed by session id
pub fn create_cart_routes() -> Router<Ledger> {
    Router::new()
        .route("/{session}", get(get_cart).delete(clear_cart))
        .route("/{session}/items", post(add_item))
        .route(
            "/{session}/items/{code}",
            put(update_item).delete(remove_item),
        )
        .route("/{session}/validate", get(validate_cart))
        .route("/{session}/checkout", post(checkout))
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub product_code: String,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: i32,
}

async fn get_cart(
    State(ledger): State<Ledger>,
    Path(session): Path<String>,
) -> HandlerResult<Cart> {
    match ledger.carts.get_cart(&session).await {
        Ok(cart) => Ok(Json(ApiResponse::success(cart))),
        Err(e) => handle_ledger_error(e),
    }
}

async fn add_item(
    State(ledger): State<Ledger>,
    Path(session): Path<String>,
    Json(request): Json<AddItemRequest>,
) -> HandlerResult<Cart> {
    match ledger
        .carts
        .add_to_cart(&session, &request.product_code, request.quantity)
        .await
    {
        Ok(cart) => Ok(Json(ApiResponse::with_message(cart, "Item added to cart"))),
        Err(e) => handle_ledger_error(e),
    }
}

async fn update_item(
    State(ledger): State<Ledger>,
    Path((session, code)): Path<(String, String)>,
    Json(request): Json<UpdateItemRequest>,
) -> HandlerResult<Cart> {
    match ledger
        .carts
        .update_cart_item(&session, &code, request.quantity)
        .await
    {
        Ok(cart) => Ok(Json(ApiResponse::success(cart))),
        Err(e) => handle_ledger_error(e),
    }
}

async fn remove_item(
    State(ledger): State<Ledger>,
    Path((session, code)): Path<(String, String)>,
) -> HandlerResult<Cart> {
    match ledger.carts.remove_from_cart(&session, &code).await {
        Ok(cart) => Ok(Json(ApiResponse::with_message(cart, "Item removed from cart"))),
        Err(e) => handle_ledger_error(e),
    }
}

async fn clear_cart(
    State(ledger): State<Ledger>,
    Path(session): Path<String>,
) -> HandlerResult<Cart> {
    match ledger.carts.clear_cart(&session).await {
        Ok(cart) => Ok(Json(ApiResponse::with_message(cart, "Cart cleared"))),
        Err(e) => handle_ledger_error(e),
    }
}

async fn validate_cart(
    State(ledger): State<Ledger>,
    Path(session): Path<String>,
) -> HandlerResult<CartValidation> {
    match ledger.carts.validate_cart(&session).await {
        Ok(validation) => Ok(Json(ApiResponse::success(validation))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/cart/{session}/checkout
async fn checkout(
    State(ledger): State<Ledger>,
    Path(session): Path<String>,
    Json(customer): Json<CustomerInfo>,
) -> HandlerResult<Order> {
    info!("🛒 Checkout requested for session {}", session);
    match ledger.checkout.checkout(&session, customer).await {
        Ok(order) => {
            let message = format!("Order {} placed", order.order_code);
            Ok(Json(ApiResponse::with_message(order, message)))
        }
        Err(e) => handle_ledger_error(e),
    }
}
