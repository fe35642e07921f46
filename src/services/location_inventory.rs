use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::commit_or_rollback;
use crate::config::LocationDefaults;
use crate::database::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{
    BatchAllocation, InventoryLocation, LocationInventoryRecord, LocationLimits, LocationType,
};

/// Rejects mutations against a location that is missing or switched off
pub(crate) async fn ensure_location_active(
    tx: &mut dyn LedgerTx,
    location: LocationType,
) -> LedgerResult<()> {
    match tx.find_location(location).await? {
        Some(entry) if entry.is_active => Ok(()),
        Some(_) => Err(LedgerError::validation(format!(
            "Location {location} is not active"
        ))),
        None => Err(LedgerError::not_found("Location", location.code())),
    }
}

/// Product-level decrement across batches, earliest expiry first.
///
/// Each batch portion is taken with the store's conditional decrement; a zero
/// row count means another writer got there first and the whole call fails.
pub(crate) async fn reduce_within(
    tx: &mut dyn LedgerTx,
    product_code: &str,
    location: LocationType,
    amount: i32,
) -> LedgerResult<Vec<BatchAllocation>> {
    if amount <= 0 {
        return Err(LedgerError::validation(format!(
            "Quantity to reduce must be greater than 0, got {amount}"
        )));
    }

    let records = tx.lock_records(product_code, location).await?;
    let available: i32 = records.iter().map(|r| r.quantity).sum();
    let insufficient = |available| LedgerError::InsufficientStock {
        product_code: product_code.to_string(),
        location,
        requested: amount,
        available,
    };
    if available < amount {
        return Err(insufficient(available));
    }

    let mut remaining = amount;
    let mut allocations = Vec::new();
    for record in records.iter().filter(|r| r.quantity > 0) {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(record.quantity);
        let affected = tx
            .decrement_if_available(record.batch_id, location, take)
            .await?;
        if affected == 0 {
            return Err(insufficient(available - (amount - remaining)));
        }
        allocations.push(BatchAllocation {
            batch_id: record.batch_id,
            quantity: take,
        });
        remaining -= take;
    }

    if remaining > 0 {
        return Err(insufficient(amount - remaining));
    }
    Ok(allocations)
}

#[derive(Clone)]
pub struct LocationInventory {
    store: Arc<dyn LedgerStore>,
    defaults: LocationDefaults,
}

impl LocationInventory {
    pub fn new(store: Arc<dyn LedgerStore>, defaults: LocationDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn limits_for(&self, location: LocationType) -> LocationLimits {
        self.defaults.for_location(location)
    }

    pub async fn list_locations(&self) -> LedgerResult<Vec<InventoryLocation>> {
        self.store.list_locations().await
    }

    /// Aggregate across batches; 0 when nothing is recorded
    pub async fn get_quantity(&self, product_code: &str, location: LocationType) -> LedgerResult<i32> {
        self.store.quantity_at(product_code, location).await
    }

    pub async fn get_quantity_by_location(
        &self,
        product_code: &str,
    ) -> LedgerResult<BTreeMap<LocationType, i32>> {
        self.store.quantity_by_location(product_code).await
    }

    pub async fn list_records(&self, product_code: &str) -> LedgerResult<Vec<LocationInventoryRecord>> {
        self.store.list_records(product_code).await
    }

    /// Upserts the (batch, location) record; returns the batch's new quantity there
    #[instrument(skip(self))]
    pub async fn add_quantity(
        &self,
        batch_id: i64,
        location: LocationType,
        delta: i32,
    ) -> LedgerResult<i32> {
        if delta == 0 {
            return Err(LedgerError::validation("Quantity delta must not be 0"));
        }
        let limits = self.limits_for(location);

        let mut tx = self.store.begin().await?;
        let result: LedgerResult<i32> = async {
            ensure_location_active(tx.as_mut(), location).await?;
            if tx.find_batch(batch_id).await?.is_none() {
                return Err(LedgerError::not_found("Batch", batch_id.to_string()));
            }
            tx.add_quantity(batch_id, location, delta, limits).await
        }
        .await;

        let resulting = commit_or_rollback(tx, result).await?;
        debug!(batch_id, %location, delta, resulting, "Location quantity updated");
        Ok(resulting)
    }

    #[instrument(skip(self))]
    pub async fn reduce_quantity(
        &self,
        product_code: &str,
        location: LocationType,
        amount: i32,
    ) -> LedgerResult<Vec<BatchAllocation>> {
        let mut tx = self.store.begin().await?;
        let result = reduce_within(tx.as_mut(), product_code, location, amount).await;
        let allocations = commit_or_rollback(tx, result).await?;
        info!(
            product = product_code,
            %location,
            amount,
            batches = allocations.len(),
            "➖ Stock reduced"
        );
        Ok(allocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn unknown_product_reads_as_zero() {
        let fx = Fixture::new().await;
        assert_eq!(
            fx.ledger.inventory.get_quantity("NOPE", LocationType::Shelf).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn add_quantity_rejects_over_capacity() {
        let fx = Fixture::new().await;
        let batch_id = fx.receive("P1", LocationType::Shelf, 10).await;
        let capacity = fx.ledger.inventory.limits_for(LocationType::Shelf).capacity;

        let result = fx
            .ledger
            .inventory
            .add_quantity(batch_id, LocationType::Shelf, capacity)
            .await;
        assert!(matches!(result, Err(LedgerError::CapacityExceeded { .. })));
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn add_quantity_overflow_is_capacity_exceeded() {
        let fx = Fixture::new().await;
        let batch_id = fx.receive("P1", LocationType::Shelf, 10).await;

        match fx
            .ledger
            .inventory
            .add_quantity(batch_id, LocationType::Shelf, i32::MAX)
            .await
        {
            Err(LedgerError::CapacityExceeded { resulting, .. }) => assert_eq!(resulting, i32::MAX),
            other => panic!("expected capacity exceeded, got {other:?}"),
        }
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn add_quantity_requires_known_batch_and_active_location() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.ledger.inventory.add_quantity(404, LocationType::Shelf, 1).await,
            Err(LedgerError::NotFound { entity: "Batch", .. })
        ));

        let batch_id = fx.receive("P1", LocationType::Warehouse, 10).await;
        fx.store.set_location_active(LocationType::Online, false).await;
        assert!(matches!(
            fx.ledger.inventory.add_quantity(batch_id, LocationType::Online, 1).await,
            Err(LedgerError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn reduce_consumes_earliest_expiry_first() {
        let fx = Fixture::new().await;
        let late = fx
            .receive_expiring("P1", LocationType::Shelf, 5, NaiveDate::from_ymd_opt(2031, 1, 1))
            .await;
        let early = fx
            .receive_expiring("P1", LocationType::Shelf, 4, NaiveDate::from_ymd_opt(2030, 1, 1))
            .await;

        let allocations = fx
            .ledger
            .inventory
            .reduce_quantity("P1", LocationType::Shelf, 6)
            .await
            .unwrap();
        assert_eq!(
            allocations,
            vec![
                BatchAllocation { batch_id: early, quantity: 4 },
                BatchAllocation { batch_id: late, quantity: 2 },
            ]
        );
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn reduce_beyond_stock_fails_and_changes_nothing() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Shelf, 3).await;

        match fx.ledger.inventory.reduce_quantity("P1", LocationType::Shelf, 4).await {
            Err(LedgerError::InsufficientStock {
                requested,
                available,
                ..
            }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected insufficient stock, got {other:?}"),
        }
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            3
        );
        assert!(matches!(
            fx.ledger.inventory.reduce_quantity("P1", LocationType::Shelf, 0).await,
            Err(LedgerError::ValidationError(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reductions_never_oversell() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 10).await;

        let mut handles = Vec::new();
        for _ in 0..25 {
            let inventory = fx.ledger.inventory.clone();
            handles.push(tokio::spawn(async move {
                inventory.reduce_quantity("P1", LocationType::Online, 1).await
            }));
        }

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(LedgerError::InsufficientStock { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(insufficient, 15);
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Online).await.unwrap(),
            0
        );
    }
}
