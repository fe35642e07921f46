use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};

use super::{handle_ledger_error, ApiError};
use crate::models::order::Order;
use crate::services::Ledger;
use crate::types::ApiResponse;

pub fn create_order_routes() -> Router<Ledger> {
    Router::new().route("/{code}", get(get_order))
}

/// GET /api/orders/{code}
async fn get_order(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    match ledger.checkout.get_order(&code).await {
        Ok(order) => Ok(Json(ApiResponse::success(order))),
        Err(e) => handle_ledger_error(e),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::handlers::test_client::{router, send};
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let fx = Fixture::new().await;
        let (status, body) = send(&router(&fx), "GET", "/api/orders/ORD-0-0000", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["entity"], "Order");
    }
}
