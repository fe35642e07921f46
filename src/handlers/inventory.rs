use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use super::{handle_ledger_error, ApiError};
use crate::error::LedgerError;
use crate::models::inventory::{
    Batch, BatchAllocation, ExpiringBatch, InventoryLocation, LocationInventoryRecord,
    LocationType, NewBatch, Product, StockMovement,
};
use crate::models::reorder::ReorderAlert;
use crate::services::batch_ledger::{ReceiptResult, ReceiveStockRequest};
use crate::services::transfer::{
    AdjustmentRequest, AdjustmentResult, TransferRequest, TransferResult,
};
use crate::services::Ledger;
use crate::types::ApiResponse;

type HandlerResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Create inventory routes
pub fn create_inventory_routes() -> Router<Ledger> {
    Router::new()
        .route("/locations", get(list_locations))
        .route("/products/{code}", get(get_product))
        .route("/products/{code}/quantity", get(get_quantity))
        .route("/products/{code}/locations", get(get_quantity_by_location))
        .route("/products/{code}/records", get(list_records))
        .route("/products/{code}/movements", get(list_movements))
        .route("/batches", post(create_batch))
        .route("/batches/expiring", get(expiring_batches))
        .route("/receipts", post(receive_stock))
        .route("/stock/add", post(add_quantity))
        .route("/stock/reduce", post(reduce_quantity))
        .route("/transfers", post(transfer))
        .route("/adjustments", post(adjust))
        .route("/reorder/alerts", get(reorder_alerts))
        .route("/reorder/alerts/{id}/resolve", post(resolve_alert))
        .route("/reorder/evaluate", post(evaluate_all))
        .route("/reorder/evaluate/{code}", post(evaluate_product))
}

#[derive(Debug, Serialize)]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub final_price: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct QuantityView {
    pub product_code: String,
    pub location: LocationType,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct AddQuantityRequest {
    pub batch_id: i64,
    pub location: LocationType,
    pub delta: i32,
}

#[derive(Debug, Serialize)]
pub struct AddQuantityResult {
    pub batch_id: i64,
    pub location: LocationType,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct ReduceQuantityRequest {
    pub product_code: String,
    pub location: LocationType,
    pub amount: i32,
}

/// Optional numeric query parameter; a present but unparsable value is a validation error
fn numeric_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, LedgerError> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| LedgerError::validation(format!("Query parameter '{key}' must be a number"))),
        None => Ok(None),
    }
}

/// GET /api/inventory/locations
async fn list_locations(State(ledger): State<Ledger>) -> HandlerResult<Vec<InventoryLocation>> {
    match ledger.inventory.list_locations().await {
        Ok(locations) => Ok(Json(ApiResponse::success(locations))),
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/products/{code}
async fn get_product(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
) -> HandlerResult<ProductView> {
    match ledger.find_product(&code).await {
        Ok(product) => {
            let final_price = product.final_price();
            Ok(Json(ApiResponse::success(ProductView {
                product,
                final_price,
            })))
        }
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/products/{code}/quantity?location=SHELF
async fn get_quantity(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> HandlerResult<QuantityView> {
    let location = match params.get("location") {
        Some(raw) => match raw.parse::<LocationType>() {
            Ok(location) => location,
            Err(e) => return handle_ledger_error(e),
        },
        None => {
            return handle_ledger_error(LedgerError::validation(
                "Query parameter 'location' is required",
            ))
        }
    };

    match ledger.inventory.get_quantity(&code, location).await {
        Ok(quantity) => Ok(Json(ApiResponse::success(QuantityView {
            product_code: code,
            location,
            quantity,
        }))),
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/products/{code}/locations
async fn get_quantity_by_location(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
) -> HandlerResult<BTreeMap<LocationType, i32>> {
    match ledger.inventory.get_quantity_by_location(&code).await {
        Ok(totals) => Ok(Json(ApiResponse::success(totals))),
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/products/{code}/records
async fn list_records(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
) -> HandlerResult<Vec<LocationInventoryRecord>> {
    match ledger.inventory.list_records(&code).await {
        Ok(records) => Ok(Json(ApiResponse::success(records))),
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/products/{code}/movements?limit=50
async fn list_movements(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> HandlerResult<Vec<StockMovement>> {
    let limit = match numeric_param::<u32>(&params, "limit") {
        Ok(limit) => limit,
        Err(e) => return handle_ledger_error(e),
    };
    match ledger.movements.list(&code, limit).await {
        Ok(movements) => Ok(Json(ApiResponse::success(movements))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/batches
async fn create_batch(
    State(ledger): State<Ledger>,
    Json(request): Json<NewBatch>,
) -> HandlerResult<Batch> {
    match ledger.batches.create_batch(request).await {
        Ok(batch) => {
            let message = format!("Batch {} created", batch.batch_code);
            Ok(Json(ApiResponse::with_message(batch, message)))
        }
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/batches/expiring?days=30
async fn expiring_batches(
    State(ledger): State<Ledger>,
    Query(params): Query<HashMap<String, String>>,
) -> HandlerResult<Vec<ExpiringBatch>> {
    let days = match numeric_param::<i64>(&params, "days") {
        Ok(days) => days,
        Err(e) => return handle_ledger_error(e),
    };
    match ledger.batches.expiring_batches(days).await {
        Ok(batches) => Ok(Json(ApiResponse::success(batches))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/receipts
async fn receive_stock(
    State(ledger): State<Ledger>,
    Json(request): Json<ReceiveStockRequest>,
) -> HandlerResult<ReceiptResult> {
    info!(
        "📥 Receipt request: {} x{} into {}",
        request.product_code, request.quantity, request.location
    );
    match ledger.batches.receive_stock(request).await {
        Ok(receipt) => {
            let message = format!(
                "Received {} into {} as batch {}",
                receipt.batch.quantity_received, receipt.location, receipt.batch.batch_code
            );
            Ok(Json(ApiResponse::with_message(receipt, message)))
        }
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/stock/add
async fn add_quantity(
    State(ledger): State<Ledger>,
    Json(request): Json<AddQuantityRequest>,
) -> HandlerResult<AddQuantityResult> {
    match ledger
        .inventory
        .add_quantity(request.batch_id, request.location, request.delta)
        .await
    {
        Ok(quantity) => Ok(Json(ApiResponse::success(AddQuantityResult {
            batch_id: request.batch_id,
            location: request.location,
            quantity,
        }))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/stock/reduce
async fn reduce_quantity(
    State(ledger): State<Ledger>,
    Json(request): Json<ReduceQuantityRequest>,
) -> HandlerResult<Vec<BatchAllocation>> {
    match ledger
        .inventory
        .reduce_quantity(&request.product_code, request.location, request.amount)
        .await
    {
        Ok(allocations) => Ok(Json(ApiResponse::success(allocations))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/transfers
async fn transfer(
    State(ledger): State<Ledger>,
    Json(request): Json<TransferRequest>,
) -> HandlerResult<TransferResult> {
    info!(
        "🔄 Transfer request: {} x{} {} -> {}",
        request.product_code, request.quantity, request.from_location, request.to_location
    );
    match ledger.transfers.transfer(request).await {
        Ok(result) => Ok(Json(ApiResponse::with_message(result, "Transfer completed"))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/adjustments
async fn adjust(
    State(ledger): State<Ledger>,
    Json(request): Json<AdjustmentRequest>,
) -> HandlerResult<AdjustmentResult> {
    match ledger.transfers.adjust(request).await {
        Ok(result) => Ok(Json(ApiResponse::with_message(result, "Adjustment recorded"))),
        Err(e) => handle_ledger_error(e),
    }
}

/// GET /api/inventory/reorder/alerts
async fn reorder_alerts(State(ledger): State<Ledger>) -> HandlerResult<Vec<ReorderAlert>> {
    match ledger.reorder.get_reorder_alerts().await {
        Ok(alerts) => Ok(Json(ApiResponse::success(alerts))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/reorder/alerts/{id}/resolve
async fn resolve_alert(
    State(ledger): State<Ledger>,
    Path(id): Path<i64>,
) -> HandlerResult<ReorderAlert> {
    match ledger.reorder.resolve_alert(id).await {
        Ok(alert) => Ok(Json(ApiResponse::with_message(alert, "Alert resolved"))),
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/reorder/evaluate
async fn evaluate_all(State(ledger): State<Ledger>) -> HandlerResult<Vec<ReorderAlert>> {
    match ledger.reorder.evaluate_all().await {
        Ok(alerts) => {
            let message = format!("{} product(s) need reordering", alerts.len());
            Ok(Json(ApiResponse::with_message(alerts, message)))
        }
        Err(e) => handle_ledger_error(e),
    }
}

/// POST /api/inventory/reorder/evaluate/{code}
async fn evaluate_product(
    State(ledger): State<Ledger>,
    Path(code): Path<String>,
) -> HandlerResult<Option<ReorderAlert>> {
    match ledger.reorder.evaluate_product(&code).await {
        Ok(Some(alert)) => Ok(Json(ApiResponse::with_message(
            Some(alert),
            "Reorder alert raised",
        ))),
        Ok(None) => Ok(Json(ApiResponse::with_message(None, "Stock is above threshold"))),
        Err(e) => handle_ledger_error(e),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::handlers::test_client::{router, send};
    use crate::models::inventory::LocationType;
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn receipt_then_quantity_lookup() {
        let fx = Fixture::new().await;
        let app = router(&fx);

        let (status, body) = send(
            &app,
            "POST",
            "/api/inventory/receipts",
            Some(json!({
                "product_code": "P1",
                "quantity": 40,
                "unit_cost": "2.50",
                "expiry_date": null,
                "location": "WAREHOUSE"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["quantity_at_location"], 40);

        let (status, body) = send(
            &app,
            "GET",
            "/api/inventory/products/P1/quantity?location=warehouse",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["quantity"], 40);
        assert_eq!(body["data"]["location"], "WAREHOUSE");
    }

    #[tokio::test]
    async fn unknown_location_and_product_are_not_found() {
        let fx = Fixture::new().await;
        let app = router(&fx);

        let (status, body) = send(
            &app,
            "GET",
            "/api/inventory/products/P1/quantity?location=BACKROOM",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["entity"], "Location");

        let (status, _) = send(&app, "GET", "/api/inventory/products/NOPE", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/inventory/products/P1/quantity", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn product_view_includes_final_price() {
        let fx = Fixture::new().await;
        let app = router(&fx);

        let (status, body) = send(&app, "GET", "/api/inventory/products/P2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["product_code"], "P2");
        assert_eq!(body["data"]["reorder_capacity"], 200);
        assert!(body["data"]["final_price"].is_string());
    }

    #[tokio::test]
    async fn over_reduction_is_a_conflict() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Shelf, 5).await;
        let app = router(&fx);

        let (status, body) = send(
            &app,
            "POST",
            "/api/inventory/stock/reduce",
            Some(json!({ "product_code": "P1", "location": "SHELF", "amount": 8 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Insufficient stock");
        assert_eq!(body["available"], 5);
    }

    #[tokio::test]
    async fn transfer_moves_stock_between_locations() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 30).await;
        let app = router(&fx);

        let (status, body) = send(
            &app,
            "POST",
            "/api/inventory/transfers",
            Some(json!({
                "product_code": "P1",
                "from_location": "WAREHOUSE",
                "to_location": "SHELF",
                "quantity": 12
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["from_quantity_after"], 18);
        assert_eq!(body["data"]["to_quantity_after"], 12);

        let (_, body) = send(&app, "GET", "/api/inventory/products/P1/locations", None).await;
        assert_eq!(body["data"]["SHELF"], 12);
        assert_eq!(body["data"]["WAREHOUSE"], 18);

        let (_, body) = send(
            &app,
            "GET",
            "/api/inventory/products/P1/movements?limit=1",
            None,
        )
        .await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["data"][0]["kind"], "TRANSFER");
    }

    #[tokio::test]
    async fn bad_numeric_query_is_a_validation_error() {
        let fx = Fixture::new().await;
        let app = router(&fx);

        let (status, _) = send(&app, "GET", "/api/inventory/batches/expiring?days=soon", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/inventory/batches/expiring?days=-1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            send(&app, "GET", "/api/inventory/batches/expiring?days=100000000", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/inventory/batches/expiring?days=3650", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn reorder_alert_can_be_raised_and_resolved() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 3).await;
        let app = router(&fx);

        let (status, body) = send(&app, "POST", "/api/inventory/reorder/evaluate/P1", None).await;
        assert_eq!(status, StatusCode::OK);
        let alert_id = body["data"]["alert_id"].as_i64().unwrap();

        let (_, body) = send(&app, "GET", "/api/inventory/reorder/alerts", None).await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let uri = format!("/api/inventory/reorder/alerts/{alert_id}/resolve");
        let (status, body) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "RESOLVED");

        let (status, _) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
