use axum::{extract::State, response::Json};
use serde::Serialize;

use super::AppState;
use crate::database::PoolStatus;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: String,
    pub message: String,
    pub timestamp: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct DatabaseStatusResponse {
    pub success: bool,
    pub status: String,
    pub backend: String,
    pub database: Option<String>,
    pub pool: Option<PoolStatus>,
    pub missing_tables: Vec<String>,
    pub issues: Vec<String>,
    pub timestamp: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        success: true,
        status: "healthy".to_string(),
        message: "Stock ledger backend is running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: VERSION.to_string(),
    })
}

/// Storage backend status: ledger tables and pool usage on SQL Server
pub async fn database_status(State(state): State<AppState>) -> Json<DatabaseStatusResponse> {
    let backend = state.ledger.store.backend_name().to_string();
    let mut issues = Vec::new();
    let mut missing_tables = Vec::new();

    let (database, pool) = match &state.database {
        Some(db) => {
            match db.verify_ledger_schema().await {
                Ok(missing) => {
                    if !missing.is_empty() {
                        issues.push(format!("{} ledger table(s) missing", missing.len()));
                    }
                    missing_tables = missing.into_iter().map(str::to_string).collect();
                }
                Err(e) => issues.push(format!("Failed to check ledger tables: {e}")),
            }
            (
                Some(db.get_database_name().to_string()),
                Some(db.get_pool_status()),
            )
        }
        None => (None, None),
    };

    let status = if issues.is_empty() { "healthy" } else { "degraded" };

    Json(DatabaseStatusResponse {
        success: issues.is_empty(),
        status: status.to_string(),
        backend,
        database,
        pool,
        missing_tables,
        issues,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
