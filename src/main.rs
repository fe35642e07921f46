use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod config;
mod constants;
mod database;
mod error;
mod handlers;
mod models;
mod services;
mod types;
mod utils;

#[cfg(test)]
mod test_support;

use config::{LedgerSettings, StoreKind};
use database::{
    monitor_pool_health, Database, LedgerStore, MemoryLedgerStore, SqlServerLedgerStore,
};
use handlers::{health::VERSION, AppState};
use models::inventory::Product;
use services::Ledger;

/// Builds the configured store; the SQL Server backend also returns its pool
async fn build_store(settings: &LedgerSettings) -> Result<(Arc<dyn LedgerStore>, Option<Database>)> {
    match settings.store_kind {
        StoreKind::SqlServer => {
            let database = Database::new()
                .await
                .context("Failed to initialize database with connection pool")?;

            info!("🔍 Validating ledger tables in database...");
            match database.verify_ledger_schema().await {
                Ok(missing) if !missing.is_empty() => {
                    warn!("⚠️  Missing ledger tables: {}", missing.join(", "));
                    warn!("    Ledger operations touching them will fail until the schema is created");
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️  Failed to check ledger tables: {}", e),
            }

            let store: Arc<dyn LedgerStore> = Arc::new(SqlServerLedgerStore::new(database.clone()));
            Ok((store, Some(database)))
        }
        StoreKind::Memory => {
            warn!("⚠️  Running on the in-memory store; nothing is persisted across restarts");
            let store = MemoryLedgerStore::new();
            if let Some(path) = &settings.memory_seed_file {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read MEMORY_SEED_FILE '{path}'"))?;
                let products: Vec<Product> = serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid product catalog in '{path}'"))?;
                store.load_products(products).await;
            }
            Ok((Arc::new(store), None))
        }
    }
}

fn build_cors(cors_origins: &str) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
    let headers = [header::CONTENT_TYPE, header::AUTHORIZATION];

    if cors_origins == "*" {
        warn!("⚠️ CORS is configured with wildcard (*) - this is only acceptable for development!");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    info!("🔒 CORS configured for specific origins: {}", cors_origins);
    let mut origins: Vec<HeaderValue> = cors_origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    if origins.is_empty() {
        warn!("⚠️ No valid CORS origins found in CORS_ORIGINS, falling back to localhost only");
        origins.push(HeaderValue::from_static("http://localhost:4400"));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with environment-based filtering
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "stock_ledger_backend=info,tower_http=warn".to_string()
        } else {
            "stock_ledger_backend=warn,tower_http=error".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!("🚀 Starting Stock Ledger Backend v{}", VERSION);

    dotenv::dotenv().ok();

    let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| constants::DEFAULT_SERVER_HOST.to_string());
    let port = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(constants::DEFAULT_SERVER_PORT);
    let cors_origins = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());

    info!("Server configured to run on {}:{}", host, port);

    let settings = LedgerSettings::from_env().context("Invalid ledger configuration")?;
    let (store, database) = build_store(&settings).await?;
    let ledger = Ledger::new(store, &settings);

    let cart_store = ledger.carts.cart_store();
    let sweep_every = settings.cart_sweep_interval;
    tokio::spawn(async move {
        cart_store.sweep_loop(sweep_every).await;
    });

    if let Some(every) = settings.reorder_evaluation_interval {
        let advisor = ledger.reorder.clone();
        tokio::spawn(async move {
            advisor.evaluation_loop(every).await;
        });
    }

    if let Some(db) = database.clone() {
        tokio::spawn(async move {
            monitor_pool_health(db).await;
        });
    }

    let state = AppState { ledger, database };

    let app: Router = handlers::create_api_routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(&cors_origins))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ));

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .with_context(|| format!("Failed to bind to {host}:{port}"))?;

    info!("🎯 Stock Ledger Server started successfully on http://{}:{}", host, port);
    info!("🔧 API endpoints available at http://{}:{}/api/", host, port);

    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
