use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants;
use crate::database::store::LedgerStore;
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{NewMovement, StockMovement};

/// Audit trail of quantity changes. Writes are best effort.
#[derive(Clone)]
pub struct MovementLog {
    store: Arc<dyn LedgerStore>,
}

impl MovementLog {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Never fails the caller; a lost audit row is only logged
    pub async fn record(&self, movement: NewMovement) {
        match self.store.record_movement(&movement).await {
            Ok(entry) => debug!(
                movement_id = entry.movement_id,
                kind = entry.kind.code(),
                product = %entry.product_code,
                quantity = entry.quantity,
                "Movement recorded"
            ),
            Err(e) => warn!(
                "⚠️ Failed to record {} movement for {}: {}",
                movement.kind.code(),
                movement.product_code,
                e
            ),
        }
    }

    pub async fn record_all(&self, movements: Vec<NewMovement>) {
        for movement in movements {
            self.record(movement).await;
        }
    }

    /// Newest first
    pub async fn list(&self, product_code: &str, limit: Option<u32>) -> LedgerResult<Vec<StockMovement>> {
        let limit = limit.unwrap_or(constants::DEFAULT_MOVEMENT_LIMIT);
        if limit == 0 || limit > constants::MAX_MOVEMENT_LIMIT {
            return Err(LedgerError::validation(format!(
                "Limit must be between 1 and {}",
                constants::MAX_MOVEMENT_LIMIT
            )));
        }
        self.store.list_movements(product_code, limit).await
    }
}
