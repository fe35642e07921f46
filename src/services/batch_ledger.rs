use bigdecimal::{BigDecimal, Zero};
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::location_inventory::ensure_location_active;
use super::{commit_or_rollback, MovementLog};
use crate::config::LocationDefaults;
use crate::constants;
use crate::database::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{
    Batch, ExpiringBatch, LocationType, MovementKind, NewBatch, NewMovement, Product,
};
use crate::utils::store_now;

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveStockRequest {
    pub product_code: String,
    pub quantity: i32,
    pub unit_cost: BigDecimal,
    pub expiry_date: Option<NaiveDate>,
    pub location: LocationType,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptResult {
    pub batch: Batch,
    pub location: LocationType,
    pub quantity_at_location: i32,
}

/// Append-only record of received lots
#[derive(Clone)]
pub struct BatchLedger {
    store: Arc<dyn LedgerStore>,
    defaults: LocationDefaults,
    timezone: Tz,
    movements: MovementLog,
}

impl BatchLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        defaults: LocationDefaults,
        timezone: Tz,
        movements: MovementLog,
    ) -> Self {
        Self {
            store,
            defaults,
            timezone,
            movements,
        }
    }

    async fn stockable_product(&self, product_code: &str) -> LedgerResult<Product> {
        let product = self
            .store
            .find_product(product_code)
            .await?
            .ok_or_else(|| LedgerError::not_found("Product", product_code))?;
        if !product.is_active {
            return Err(LedgerError::validation(format!(
                "Product {product_code} is inactive and cannot be stocked"
            )));
        }
        Ok(product)
    }

    fn validate(batch: &NewBatch) -> LedgerResult<()> {
        if batch.quantity_received <= 0 {
            return Err(LedgerError::validation(format!(
                "Quantity received must be greater than 0, got {}",
                batch.quantity_received
            )));
        }
        if batch.unit_cost < BigDecimal::zero() {
            return Err(LedgerError::validation("Unit cost must not be negative"));
        }
        Ok(())
    }

    /// `B-<product>-<yyyymmdd>-<8 hex>`, unique per received lot
    fn next_batch_code(&self, product_code: &str) -> String {
        let day = store_now(self.timezone).format("%Y%m%d");
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
        format!("B-{product_code}-{day}-{suffix}")
    }

    async fn insert_within(&self, tx: &mut dyn LedgerTx, batch: &NewBatch) -> LedgerResult<Batch> {
        let batch_code = self.next_batch_code(&batch.product_code);
        tx.insert_batch(batch, &batch_code).await
    }

    /// Records a new lot without placing it anywhere
    #[instrument(skip(self, batch), fields(product = %batch.product_code))]
    pub async fn create_batch(&self, batch: NewBatch) -> LedgerResult<Batch> {
        Self::validate(&batch)?;
        self.stockable_product(&batch.product_code).await?;

        let mut tx = self.store.begin().await?;
        let result = self.insert_within(tx.as_mut(), &batch).await;
        let created = commit_or_rollback(tx, result).await?;

        info!(
            "📦 Batch {} created: {} x {}",
            created.batch_code, created.quantity_received, created.product_code
        );
        Ok(created)
    }

    /// Creates the lot and places it at a location in one transaction
    #[instrument(skip(self, request), fields(product = %request.product_code, location = %request.location))]
    pub async fn receive_stock(&self, request: ReceiveStockRequest) -> LedgerResult<ReceiptResult> {
        let batch = NewBatch {
            product_code: request.product_code.trim().to_string(),
            quantity_received: request.quantity,
            unit_cost: request.unit_cost.clone(),
            expiry_date: request.expiry_date,
        };
        Self::validate(&batch)?;
        self.stockable_product(&batch.product_code).await?;
        let limits = self.defaults.for_location(request.location);

        let mut tx = self.store.begin().await?;
        let result: LedgerResult<ReceiptResult> = async {
            ensure_location_active(tx.as_mut(), request.location).await?;
            let created = self.insert_within(tx.as_mut(), &batch).await?;
            let quantity_at_location = tx
                .add_quantity(created.batch_id, request.location, batch.quantity_received, limits)
                .await?;
            Ok(ReceiptResult {
                batch: created,
                location: request.location,
                quantity_at_location,
            })
        }
        .await;

        let receipt = commit_or_rollback(tx, result)
            .await
            .map_err(LedgerError::into_transaction_failure)?;

        self.movements
            .record(NewMovement {
                product_code: receipt.batch.product_code.clone(),
                batch_id: Some(receipt.batch.batch_id),
                from_location: None,
                to_location: Some(receipt.location),
                quantity: receipt.batch.quantity_received,
                kind: MovementKind::Receipt,
                reason: request
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("Received batch {}", receipt.batch.batch_code)),
            })
            .await;

        info!(
            "✅ Received {} x {} into {} (batch {})",
            receipt.batch.quantity_received,
            receipt.batch.product_code,
            receipt.location,
            receipt.batch.batch_code
        );
        Ok(receipt)
    }

    pub async fn find_batch(&self, batch_id: i64) -> LedgerResult<Batch> {
        self.store
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Batch", batch_id.to_string()))
    }

    /// Lots expiring within `within_days` of today (store timezone) that still hold stock
    pub async fn expiring_batches(&self, within_days: Option<i64>) -> LedgerResult<Vec<ExpiringBatch>> {
        let days = within_days.unwrap_or(constants::DEFAULT_EXPIRY_WINDOW_DAYS);
        if days < 0 {
            return Err(LedgerError::validation("Expiry window must not be negative"));
        }
        if days > constants::MAX_EXPIRY_WINDOW_DAYS {
            return Err(LedgerError::validation(format!(
                "Expiry window must be at most {} days, got {days}",
                constants::MAX_EXPIRY_WINDOW_DAYS
            )));
        }
        let cutoff = store_now(self.timezone)
            .date_naive()
            .checked_add_signed(Duration::days(days))
            .ok_or_else(|| {
                LedgerError::validation(format!("Expiry window of {days} days is out of range"))
            })?;
        self.store.expiring_batches(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    fn new_batch(code: &str, qty: i32) -> NewBatch {
        NewBatch {
            product_code: code.to_string(),
            quantity_received: qty,
            unit_cost: BigDecimal::from(3),
            expiry_date: None,
        }
    }

    #[tokio::test]
    async fn create_batch_validates_product_and_quantity() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.ledger.batches.create_batch(new_batch("NOPE", 5)).await,
            Err(LedgerError::NotFound { entity: "Product", .. })
        ));
        assert!(matches!(
            fx.ledger.batches.create_batch(new_batch("P1", 0)).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            fx.ledger.batches.create_batch(new_batch("P3", 5)).await,
            Err(LedgerError::ValidationError(_))
        ));

        let batch = fx.ledger.batches.create_batch(new_batch("P1", 5)).await.unwrap();
        assert!(batch.batch_code.starts_with("B-P1-"));
        assert_eq!(batch.quantity_received, 5);
        // creating a lot places nothing
        assert!(fx.ledger.inventory.list_records("P1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_codes_are_unique() {
        let fx = Fixture::new().await;
        let a = fx.ledger.batches.create_batch(new_batch("P1", 1)).await.unwrap();
        let b = fx.ledger.batches.create_batch(new_batch("P1", 1)).await.unwrap();
        assert_ne!(a.batch_code, b.batch_code);
        assert_ne!(a.batch_id, b.batch_id);
    }

    #[tokio::test]
    async fn receive_stock_places_lot_and_logs_receipt() {
        let fx = Fixture::new().await;
        let receipt = fx
            .ledger
            .batches
            .receive_stock(ReceiveStockRequest {
                product_code: "P1".to_string(),
                quantity: 40,
                unit_cost: BigDecimal::from(2),
                expiry_date: None,
                location: LocationType::Warehouse,
                reason: None,
            })
            .await
            .unwrap();

        assert_eq!(receipt.quantity_at_location, 40);
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Warehouse).await.unwrap(),
            40
        );
        let movements = fx.ledger.movements.list("P1", None).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].kind, MovementKind::Receipt);
        assert_eq!(movements[0].batch_id, Some(receipt.batch.batch_id));
    }

    #[tokio::test]
    async fn receive_over_capacity_leaves_no_orphan_batch() {
        let fx = Fixture::new().await;
        let capacity = fx.ledger.inventory.limits_for(LocationType::Shelf).capacity;
        let result = fx
            .ledger
            .batches
            .receive_stock(ReceiveStockRequest {
                product_code: "P1".to_string(),
                quantity: capacity + 1,
                unit_cost: BigDecimal::from(2),
                expiry_date: None,
                location: LocationType::Shelf,
                reason: None,
            })
            .await;
        assert!(matches!(result, Err(LedgerError::CapacityExceeded { .. })));
        assert!(fx.store.find_batch(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiring_report_lists_only_stocked_lots_inside_window() {
        let fx = Fixture::new().await;
        let today = store_now(chrono_tz::Asia::Bangkok).date_naive();
        let soon = fx
            .receive_expiring("P1", LocationType::Shelf, 5, Some(today + Duration::days(3)))
            .await;
        fx.receive_expiring("P1", LocationType::Shelf, 5, Some(today + Duration::days(90)))
            .await;
        let emptied = fx
            .receive_expiring("P2", LocationType::Online, 2, Some(today + Duration::days(1)))
            .await;
        fx.ledger
            .inventory
            .reduce_quantity("P2", LocationType::Online, 2)
            .await
            .unwrap();

        let expiring = fx.ledger.batches.expiring_batches(Some(7)).await.unwrap();
        let ids: Vec<i64> = expiring.iter().map(|e| e.batch.batch_id).collect();
        assert_eq!(ids, vec![soon]);
        assert!(!ids.contains(&emptied));
        assert_eq!(expiring[0].remaining_quantity, 5);

        assert!(matches!(
            fx.ledger.batches.expiring_batches(Some(-1)).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            fx.ledger.batches.expiring_batches(Some(100_000_000)).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(fx
            .ledger
            .batches
            .expiring_batches(Some(constants::MAX_EXPIRY_WINDOW_DAYS))
            .await
            .is_ok());
    }
}
