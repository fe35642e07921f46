use std::sync::Arc;
use tracing::warn;

use crate::config::LedgerSettings;
use crate::database::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::Product;

pub mod batch_ledger;
pub mod cart;
pub mod checkout;
pub mod location_inventory;
pub mod movement_log;
pub mod reorder;
pub mod transfer;

pub use batch_ledger::BatchLedger;
pub use cart::{CartService, CartStore};
pub use checkout::CheckoutService;
pub use location_inventory::LocationInventory;
pub use movement_log::MovementLog;
pub use reorder::ReorderAdvisor;
pub use transfer::TransferEngine;

/// Commit when the body succeeded, roll back otherwise
pub(crate) async fn commit_or_rollback<T>(
    tx: Box<dyn LedgerTx>,
    result: LedgerResult<T>,
) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("⚠️ Rollback failed after '{}': {}", e, rollback_err);
            }
            Err(e)
        }
    }
}

/// Every ledger service wired over one store
#[derive(Clone)]
pub struct Ledger {
    pub store: Arc<dyn LedgerStore>,
    pub batches: BatchLedger,
    pub inventory: LocationInventory,
    pub reorder: ReorderAdvisor,
    pub transfers: TransferEngine,
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub movements: MovementLog,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, settings: &LedgerSettings) -> Self {
        let movements = MovementLog::new(store.clone());
        let cart_store = Arc::new(CartStore::new(settings.cart_ttl));

        Self {
            batches: BatchLedger::new(
                store.clone(),
                settings.location_defaults,
                settings.timezone,
                movements.clone(),
            ),
            inventory: LocationInventory::new(store.clone(), settings.location_defaults),
            reorder: ReorderAdvisor::new(store.clone(), settings.reorder),
            transfers: TransferEngine::new(
                store.clone(),
                settings.location_defaults,
                movements.clone(),
            ),
            carts: CartService::new(store.clone(), cart_store.clone()),
            checkout: CheckoutService::new(
                store.clone(),
                cart_store,
                settings.checkout_timeout,
                settings.timezone,
                movements.clone(),
            ),
            movements,
            store,
        }
    }

    /// Catalog lookup; unknown codes are `NotFound`
    pub async fn find_product(&self, product_code: &str) -> LedgerResult<Product> {
        self.store
            .find_product(product_code)
            .await?
            .ok_or_else(|| LedgerError::not_found("Product", product_code))
    }
}
