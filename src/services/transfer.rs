use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::location_inventory::{ensure_location_active, reduce_within};
use super::{commit_or_rollback, MovementLog};
use crate::config::LocationDefaults;
use crate::constants;
use crate::database::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{BatchAllocation, LocationType, MovementKind, NewMovement};

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub product_code: String,
    pub from_location: LocationType,
    pub to_location: LocationType,
    pub quantity: i32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub product_code: String,
    pub from_location: LocationType,
    pub to_location: LocationType,
    pub quantity: i32,
    pub allocations: Vec<BatchAllocation>,
    pub from_quantity_after: i32,
    pub to_quantity_after: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustmentRequest {
    pub product_code: String,
    pub location: LocationType,
    pub delta: i32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentResult {
    pub product_code: String,
    pub location: LocationType,
    pub delta: i32,
    pub allocations: Vec<BatchAllocation>,
    pub quantity_after: i32,
}

async fn quantity_within(
    tx: &mut dyn LedgerTx,
    product_code: &str,
    location: LocationType,
) -> LedgerResult<i32> {
    let records = tx.lock_records(product_code, location).await?;
    Ok(records.iter().map(|r| r.quantity).sum())
}

fn checked_reason(reason: &str, fallback: &str) -> LedgerResult<String> {
    let reason = reason.trim();
    if reason.len() > constants::MAX_REASON_LENGTH {
        return Err(LedgerError::validation(format!(
            "Reason must be at most {} characters",
            constants::MAX_REASON_LENGTH
        )));
    }
    Ok(if reason.is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    })
}

/// Moves stock between locations and applies manual corrections
#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn LedgerStore>,
    defaults: LocationDefaults,
    movements: MovementLog,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn LedgerStore>, defaults: LocationDefaults, movements: MovementLog) -> Self {
        Self {
            store,
            defaults,
            movements,
        }
    }

    async fn ensure_product(&self, product_code: &str) -> LedgerResult<()> {
        match self.store.find_product(product_code).await? {
            Some(_) => Ok(()),
            None => Err(LedgerError::not_found("Product", product_code)),
        }
    }

    /// Reduce at the source and add at the destination in one transaction.
    ///
    /// Each consumed batch portion lands on the same batch at the
    /// destination, so lot identity and expiry travel with the stock.
    #[instrument(skip(self, request), fields(product = %request.product_code, from = %request.from_location, to = %request.to_location, quantity = request.quantity))]
    pub async fn transfer(&self, request: TransferRequest) -> LedgerResult<TransferResult> {
        if request.quantity <= 0 {
            return Err(LedgerError::validation(format!(
                "Transfer quantity must be greater than 0, got {}",
                request.quantity
            )));
        }
        if request.from_location == request.to_location {
            return Err(LedgerError::validation(
                "Source and destination locations must differ",
            ));
        }
        let reason = checked_reason(
            &request.reason,
            &format!("Transfer {} -> {}", request.from_location, request.to_location),
        )?;
        let product_code = request.product_code.trim();
        self.ensure_product(product_code).await?;
        let to_limits = self.defaults.for_location(request.to_location);

        let mut tx = self.store.begin().await?;
        let result: LedgerResult<TransferResult> = async {
            ensure_location_active(tx.as_mut(), request.from_location).await?;
            ensure_location_active(tx.as_mut(), request.to_location).await?;

            // Lock both sides in location order so opposing transfers cannot deadlock
            let (first, second) = if request.from_location < request.to_location {
                (request.from_location, request.to_location)
            } else {
                (request.to_location, request.from_location)
            };
            tx.lock_records(product_code, first).await?;
            tx.lock_records(product_code, second).await?;

            let allocations =
                reduce_within(tx.as_mut(), product_code, request.from_location, request.quantity)
                    .await?;
            for allocation in &allocations {
                tx.add_quantity(
                    allocation.batch_id,
                    request.to_location,
                    allocation.quantity,
                    to_limits,
                )
                .await?;
            }

            Ok(TransferResult {
                product_code: product_code.to_string(),
                from_location: request.from_location,
                to_location: request.to_location,
                quantity: request.quantity,
                from_quantity_after: quantity_within(tx.as_mut(), product_code, request.from_location)
                    .await?,
                to_quantity_after: quantity_within(tx.as_mut(), product_code, request.to_location)
                    .await?,
                allocations,
            })
        }
        .await;

        let transferred = commit_or_rollback(tx, result).await.map_err(|e| {
            warn!("❌ Transfer of {} rolled back: {}", product_code, e);
            e.into_transaction_failure()
        })?;

        self.movements
            .record_all(
                transferred
                    .allocations
                    .iter()
                    .map(|allocation| NewMovement {
                        product_code: transferred.product_code.clone(),
                        batch_id: Some(allocation.batch_id),
                        from_location: Some(transferred.from_location),
                        to_location: Some(transferred.to_location),
                        quantity: allocation.quantity,
                        kind: MovementKind::Transfer,
                        reason: reason.clone(),
                    })
                    .collect(),
            )
            .await;

        info!(
            "🔄 Transferred {} x {} from {} to {}",
            transferred.quantity,
            transferred.product_code,
            transferred.from_location,
            transferred.to_location
        );
        Ok(transferred)
    }

    /// Manual correction at one location.
    ///
    /// Positive deltas land on the newest lot already at the location, or the
    /// product's newest lot when the location holds none. Negative deltas
    /// consume lots in allocation order.
    #[instrument(skip(self, request), fields(product = %request.product_code, location = %request.location, delta = request.delta))]
    pub async fn adjust(&self, request: AdjustmentRequest) -> LedgerResult<AdjustmentResult> {
        if request.delta == 0 {
            return Err(LedgerError::validation("Adjustment delta must not be 0"));
        }
        let reason = checked_reason(&request.reason, "Manual adjustment")?;
        let product_code = request.product_code.trim();
        self.ensure_product(product_code).await?;
        let location = request.location;
        let limits = self.defaults.for_location(location);

        let mut tx = self.store.begin().await?;
        let result: LedgerResult<AdjustmentResult> = async {
            ensure_location_active(tx.as_mut(), location).await?;

            let allocations = if request.delta > 0 {
                let records = tx.lock_records(product_code, location).await?;
                let newest = records
                    .iter()
                    .max_by(|a, b| {
                        a.received_at
                            .cmp(&b.received_at)
                            .then_with(|| a.batch_id.cmp(&b.batch_id))
                    })
                    .map(|r| r.batch_id);
                let batch_id = match newest {
                    Some(batch_id) => batch_id,
                    None => tx
                        .latest_batch(product_code)
                        .await?
                        .map(|b| b.batch_id)
                        .ok_or_else(|| {
                            LedgerError::validation(format!(
                                "No batch has been received for {product_code}"
                            ))
                        })?,
                };
                tx.add_quantity(batch_id, location, request.delta, limits).await?;
                vec![BatchAllocation {
                    batch_id,
                    quantity: request.delta,
                }]
            } else {
                reduce_within(tx.as_mut(), product_code, location, -request.delta)
                    .await
                    .map_err(|e| match e {
                        LedgerError::InsufficientStock {
                            requested, available, ..
                        } => LedgerError::validation(format!(
                            "Cannot remove {requested} x {product_code} at {location}: only {available} on hand"
                        )),
                        other => other,
                    })?
            };

            Ok(AdjustmentResult {
                product_code: product_code.to_string(),
                location,
                delta: request.delta,
                allocations,
                quantity_after: quantity_within(tx.as_mut(), product_code, location).await?,
            })
        }
        .await;

        let adjusted = commit_or_rollback(tx, result)
            .await
            .map_err(LedgerError::into_transaction_failure)?;

        let increase = adjusted.delta > 0;
        self.movements
            .record_all(
                adjusted
                    .allocations
                    .iter()
                    .map(|allocation| NewMovement {
                        product_code: adjusted.product_code.clone(),
                        batch_id: Some(allocation.batch_id),
                        from_location: (!increase).then_some(location),
                        to_location: increase.then_some(location),
                        quantity: allocation.quantity,
                        kind: MovementKind::Adjustment,
                        reason: reason.clone(),
                    })
                    .collect(),
            )
            .await;

        info!(
            "🛠️ Adjusted {} at {} by {} (now {})",
            adjusted.product_code, location, adjusted.delta, adjusted.quantity_after
        );
        Ok(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{customer, Fixture};

    fn transfer(from: LocationType, to: LocationType, quantity: i32) -> TransferRequest {
        TransferRequest {
            product_code: "P1".to_string(),
            from_location: from,
            to_location: to,
            quantity,
            reason: String::new(),
        }
    }

    fn adjust(location: LocationType, delta: i32) -> AdjustmentRequest {
        AdjustmentRequest {
            product_code: "P1".to_string(),
            location,
            delta,
            reason: "cycle count".to_string(),
        }
    }

    async fn total(fx: &Fixture) -> i32 {
        fx.ledger
            .inventory
            .get_quantity_by_location("P1")
            .await
            .unwrap()
            .values()
            .sum()
    }

    #[tokio::test]
    async fn transfer_conserves_units_and_keeps_batch_identity() {
        let fx = Fixture::new().await;
        let batch_id = fx.receive("P1", LocationType::Warehouse, 100).await;

        let result = fx
            .ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Shelf, 30))
            .await
            .unwrap();
        assert_eq!(result.from_quantity_after, 70);
        assert_eq!(result.to_quantity_after, 30);
        assert_eq!(result.allocations, vec![BatchAllocation { batch_id, quantity: 30 }]);
        assert_eq!(total(&fx).await, 100);

        let shelf = fx.ledger.inventory.list_records("P1").await.unwrap();
        assert!(shelf
            .iter()
            .any(|r| r.location == LocationType::Shelf && r.batch_id == batch_id && r.quantity == 30));

        let movements = fx.ledger.movements.list("P1", None).await.unwrap();
        assert_eq!(movements[0].kind, MovementKind::Transfer);
        assert_eq!(movements[0].from_location, Some(LocationType::Warehouse));
    }

    #[tokio::test]
    async fn transfer_rejects_bad_requests() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 5).await;
        let engine = &fx.ledger.transfers;

        assert!(matches!(
            engine.transfer(transfer(LocationType::Warehouse, LocationType::Warehouse, 1)).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            engine.transfer(transfer(LocationType::Warehouse, LocationType::Shelf, 0)).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            engine.transfer(transfer(LocationType::Warehouse, LocationType::Shelf, 6)).await,
            Err(LedgerError::InsufficientStock { requested: 6, available: 5, .. })
        ));
        let mut unknown = transfer(LocationType::Warehouse, LocationType::Shelf, 1);
        unknown.product_code = "NOPE".to_string();
        assert!(matches!(
            engine.transfer(unknown).await,
            Err(LedgerError::NotFound { entity: "Product", .. })
        ));
    }

    #[tokio::test]
    async fn failed_add_rolls_back_the_reduce() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 40).await;
        fx.store.fail_next_add_quantity();

        let result = fx
            .ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Online, 10))
            .await;
        assert!(matches!(result, Err(LedgerError::TransactionFailed(_))));
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Warehouse).await.unwrap(),
            40
        );
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Online).await.unwrap(),
            0
        );
        assert!(fx
            .ledger
            .movements
            .list("P1", None)
            .await
            .unwrap()
            .iter()
            .all(|m| m.kind != MovementKind::Transfer));
    }

    #[tokio::test]
    async fn destination_capacity_failure_leaves_source_intact() {
        let fx = Fixture::new().await;
        let shelf_capacity = fx.ledger.inventory.limits_for(LocationType::Shelf).capacity;
        fx.receive("P1", LocationType::Warehouse, shelf_capacity + 10).await;

        let result = fx
            .ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Shelf, shelf_capacity + 1))
            .await;
        assert!(matches!(result, Err(LedgerError::CapacityExceeded { .. })));
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Warehouse).await.unwrap(),
            shelf_capacity + 10
        );
    }

    #[tokio::test]
    async fn lost_audit_row_does_not_fail_the_transfer() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 10).await;
        fx.store.fail_next_record_movement();

        fx.ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Shelf, 4))
            .await
            .unwrap();
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn adjust_up_and_down() {
        let fx = Fixture::new().await;
        let older = fx.receive("P1", LocationType::Shelf, 5).await;
        let newer = fx.receive("P1", LocationType::Shelf, 5).await;

        let up = fx.ledger.transfers.adjust(adjust(LocationType::Shelf, 3)).await.unwrap();
        assert_eq!(up.allocations, vec![BatchAllocation { batch_id: newer, quantity: 3 }]);
        assert_eq!(up.quantity_after, 13);

        let down = fx.ledger.transfers.adjust(adjust(LocationType::Shelf, -6)).await.unwrap();
        assert_eq!(down.quantity_after, 7);
        assert_eq!(down.allocations[0], BatchAllocation { batch_id: older, quantity: 5 });

        let result = fx.ledger.transfers.adjust(adjust(LocationType::Shelf, -8)).await;
        assert!(matches!(result, Err(LedgerError::ValidationError(_))));
        assert_eq!(
            fx.ledger.inventory.get_quantity("P1", LocationType::Shelf).await.unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn adjust_up_at_empty_location_uses_latest_batch() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.ledger.transfers.adjust(adjust(LocationType::Online, 2)).await,
            Err(LedgerError::ValidationError(_))
        ));

        let batch_id = fx.receive("P1", LocationType::Warehouse, 5).await;
        let result = fx.ledger.transfers.adjust(adjust(LocationType::Online, 2)).await.unwrap();
        assert_eq!(result.allocations[0].batch_id, batch_id);
        assert_eq!(result.quantity_after, 2);
    }

    #[tokio::test]
    async fn on_hand_equals_received_minus_sold_minus_scrapped() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 60).await;
        fx.receive("P1", LocationType::Online, 20).await;
        let received = 80;

        fx.ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Online, 15))
            .await
            .unwrap();
        fx.ledger
            .transfers
            .transfer(transfer(LocationType::Warehouse, LocationType::Shelf, 10))
            .await
            .unwrap();

        fx.ledger.carts.add_to_cart("s-1", "P1", 12).await.unwrap();
        fx.ledger.checkout.checkout("s-1", customer()).await.unwrap();
        let sold = 12;

        fx.ledger.transfers.adjust(adjust(LocationType::Shelf, -4)).await.unwrap();
        fx.ledger.transfers.adjust(adjust(LocationType::Warehouse, -1)).await.unwrap();
        let scrapped = 5;

        // failed operations must not disturb the balance
        let _ = fx
            .ledger
            .transfers
            .transfer(transfer(LocationType::Shelf, LocationType::Online, 100))
            .await;
        let _ = fx.ledger.transfers.adjust(adjust(LocationType::Online, -500)).await;

        assert_eq!(total(&fx).await, received - sold - scrapped);
    }
}
