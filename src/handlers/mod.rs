use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;

use crate::database::Database;
use crate::error::LedgerError;
use crate::services::Ledger;

pub mod cart;
pub mod health;
pub mod inventory;
pub mod orders;

pub type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    /// Present only when running on SQL Server
    pub database: Option<Database>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.ledger.store.backend_name())
            .field("database", &self.database)
            .finish()
    }
}

/// Every API route, without the outer middleware layers
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/database/status", get(health::database_status))
        .nest(
            "/api/inventory",
            inventory::create_inventory_routes().with_state(state.ledger.clone()),
        )
        .nest(
            "/api/cart",
            cart::create_cart_routes().with_state(state.ledger.clone()),
        )
        .nest(
            "/api/orders",
            orders::create_order_routes().with_state(state.ledger.clone()),
        )
        .with_state(state)
}

/// Maps a ledger error onto a status code and JSON error body
pub fn handle_ledger_error<T>(error: LedgerError) -> Result<T, ApiError> {
    let message = error.to_string();
    match error {
        LedgerError::NotFound { entity, key } => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Not found",
                "message": message,
                "entity": entity,
                "key": key
            })),
        )),
        LedgerError::ValidationError(msg) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Validation error",
                "message": msg
            })),
        )),
        LedgerError::EmptyCart { session_id } => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Empty cart",
                "message": message,
                "session_id": session_id
            })),
        )),
        LedgerError::CapacityExceeded {
            batch_id,
            location,
            resulting,
            capacity,
        } => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Capacity exceeded",
                "message": message,
                "batch_id": batch_id,
                "location": location,
                "resulting": resulting,
                "capacity": capacity
            })),
        )),
        LedgerError::InsufficientStock {
            product_code,
            location,
            requested,
            available,
        } => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Insufficient stock",
                "message": message,
                "product_code": product_code,
                "location": location,
                "requested": requested,
                "available": available
            })),
        )),
        LedgerError::OutOfStock {
            product_code,
            requested,
            available,
        } => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Out of stock",
                "message": message,
                "product_code": product_code,
                "requested": requested,
                "available": available
            })),
        )),
        LedgerError::TransactionFailed(msg) => {
            tracing::error!("Transaction error: {msg}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Transaction error",
                    "message": "Failed to complete transaction"
                })),
            ))
        }
        LedgerError::DatabaseError(msg) => {
            tracing::error!("Database error: {msg}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Database error",
                    "message": "Internal server error occurred"
                })),
            ))
        }
    }
}
