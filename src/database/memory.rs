//! Embedded ledger store.
//!
//! The whole ledger sits behind one async mutex, so every transaction is
//! serializable. A transaction owns the guard plus a snapshot taken at
//! `begin`; rollback (explicit or by drop) restores the snapshot.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{
    Batch, ExpiringBatch, InventoryLocation, LocationInventoryRecord, LocationLimits,
    LocationType, NewBatch, NewMovement, Product, SalesVelocity, StockMovement,
};
use crate::models::order::{NewOrder, Order};
use crate::models::reorder::{AlertStatus, NewAlert, ReorderAlert};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    products: BTreeMap<String, Product>,
    locations: BTreeMap<LocationType, InventoryLocation>,
    batches: BTreeMap<i64, Batch>,
    batch_codes: HashSet<String>,
    records: BTreeMap<(i64, LocationType), LocationInventoryRecord>,
    movements: Vec<StockMovement>,
    alerts: BTreeMap<i64, ReorderAlert>,
    orders: BTreeMap<String, Order>,
    next_batch_id: i64,
    next_record_id: i64,
    next_movement_id: i64,
    next_alert_id: i64,
    next_order_id: i64,
}

impl LedgerState {
    fn seeded() -> Self {
        let mut state = Self::default();
        for (idx, code) in LocationType::ALL.iter().enumerate() {
            state.locations.insert(
                *code,
                InventoryLocation {
                    location_id: idx as i32 + 1,
                    code: *code,
                    name: location_name(*code).to_string(),
                    is_active: true,
                },
            );
        }
        state
    }

    fn product_records(
        &self,
        product_code: &str,
    ) -> impl Iterator<Item = &LocationInventoryRecord> + '_ {
        let product_code = product_code.to_string();
        self.records
            .values()
            .filter(move |record| record.product_code == product_code)
    }
}

fn location_name(code: LocationType) -> &'static str {
    match code {
        LocationType::Warehouse => "Main warehouse",
        LocationType::Shelf => "Store shelf",
        LocationType::Online => "Online channel",
    }
}

/// One-shot failures and delays for exercising rollback paths
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_add_quantity: AtomicBool,
    fail_insert_order: AtomicBool,
    fail_record_movement: AtomicBool,
    insert_order_delay_ms: AtomicU64,
}

impl FaultPlan {
    fn trip(flag: &AtomicBool, step: &str) -> LedgerResult<()> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::DatabaseError(format!(
                "injected failure in {step}"
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<FaultPlan>,
}

impl std::fmt::Debug for MemoryLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedgerStore").finish()
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::seeded())),
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// Catalog rows are owned elsewhere; this is how they reach the embedded store
    pub async fn upsert_product(&self, product: Product) {
        let mut state = self.state.lock().await;
        debug!("Catalog upsert for product {}", product.product_code);
        state.products.insert(product.product_code.clone(), product);
    }

    pub async fn load_products(&self, products: Vec<Product>) -> usize {
        let count = products.len();
        for product in products {
            self.upsert_product(product).await;
        }
        info!("📦 Loaded {} catalog products into memory store", count);
        count
    }

    pub async fn set_location_active(&self, location: LocationType, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.locations.get_mut(&location) {
            entry.is_active = active;
        }
    }

    #[cfg(test)]
    pub fn fail_next_add_quantity(&self) {
        self.faults.fail_add_quantity.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_next_insert_order(&self) {
        self.faults.fail_insert_order.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_next_record_movement(&self) {
        self.faults.fail_record_movement.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn delay_next_insert_order(&self, delay: Duration) {
        self.faults
            .insert_order_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
            faults: self.faults.clone(),
        }))
    }

    async fn find_product(&self, product_code: &str) -> LedgerResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(product_code).cloned())
    }

    async fn list_active_products(&self) -> LedgerResult<Vec<Product>> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn list_locations(&self) -> LedgerResult<Vec<InventoryLocation>> {
        Ok(self.state.lock().await.locations.values().cloned().collect())
    }

    async fn find_batch(&self, batch_id: i64) -> LedgerResult<Option<Batch>> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }

    async fn quantity_at(&self, product_code: &str, location: LocationType) -> LedgerResult<i32> {
        let state = self.state.lock().await;
        Ok(state
            .product_records(product_code)
            .filter(|r| r.location == location)
            .map(|r| r.quantity)
            .sum())
    }

    async fn quantity_by_location(
        &self,
        product_code: &str,
    ) -> LedgerResult<BTreeMap<LocationType, i32>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<LocationType, i32> =
            LocationType::ALL.iter().map(|l| (*l, 0)).collect();
        for record in state.product_records(product_code) {
            *totals.entry(record.location).or_insert(0) += record.quantity;
        }
        Ok(totals)
    }

    async fn list_records(&self, product_code: &str) -> LedgerResult<Vec<LocationInventoryRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.product_records(product_code).cloned().collect();
        records.sort_by(|a, b| {
            a.location
                .cmp(&b.location)
                .then_with(|| LocationInventoryRecord::allocation_order(a, b))
        });
        Ok(records)
    }

    async fn sales_velocity(
        &self,
        product_code: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<SalesVelocity> {
        let state = self.state.lock().await;
        let mut velocity = SalesVelocity::default();
        for order in state.orders.values().filter(|o| o.created_at >= since) {
            let units: i32 = order
                .items
                .iter()
                .filter(|item| item.product_code == product_code)
                .map(|item| item.quantity)
                .sum();
            if units > 0 {
                velocity.transactions += 1;
                velocity.units_sold += units;
            }
        }
        Ok(velocity)
    }

    async fn expiring_batches(&self, on_or_before: NaiveDate) -> LedgerResult<Vec<ExpiringBatch>> {
        let state = self.state.lock().await;
        let mut expiring = Vec::new();
        for batch in state.batches.values() {
            let Some(expiry) = batch.expiry_date else {
                continue;
            };
            if expiry > on_or_before {
                continue;
            }
            let remaining: i32 = state
                .records
                .values()
                .filter(|r| r.batch_id == batch.batch_id)
                .map(|r| r.quantity)
                .sum();
            if remaining > 0 {
                expiring.push(ExpiringBatch {
                    batch: batch.clone(),
                    remaining_quantity: remaining,
                });
            }
        }
        expiring.sort_by(|a, b| a.batch.expiry_date.cmp(&b.batch.expiry_date));
        Ok(expiring)
    }

    async fn record_movement(&self, movement: &NewMovement) -> LedgerResult<StockMovement> {
        FaultPlan::trip(&self.faults.fail_record_movement, "record_movement")?;
        let mut state = self.state.lock().await;
        state.next_movement_id += 1;
        let entry = StockMovement {
            movement_id: state.next_movement_id,
            product_code: movement.product_code.clone(),
            batch_id: movement.batch_id,
            from_location: movement.from_location,
            to_location: movement.to_location,
            quantity: movement.quantity,
            kind: movement.kind,
            reason: movement.reason.clone(),
            recorded_at: Utc::now(),
        };
        state.movements.push(entry.clone());
        Ok(entry)
    }

    async fn list_movements(
        &self,
        product_code: &str,
        limit: u32,
    ) -> LedgerResult<Vec<StockMovement>> {
        let state = self.state.lock().await;
        Ok(state
            .movements
            .iter()
            .rev()
            .filter(|m| m.product_code == product_code)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> LedgerResult<Vec<ReorderAlert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect())
    }

    async fn find_alert(&self, alert_id: i64) -> LedgerResult<Option<ReorderAlert>> {
        Ok(self.state.lock().await.alerts.get(&alert_id).cloned())
    }

    async fn resolve_alert(&self, alert_id: i64) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        match state.alerts.get_mut(&alert_id) {
            Some(alert) if alert.status == AlertStatus::Open => {
                alert.status = AlertStatus::Resolved;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_order(&self, order_code: &str) -> LedgerResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(order_code).cloned())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    snapshot: Option<LedgerState>,
    faults: Arc<FaultPlan>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn insert_batch(&mut self, batch: &NewBatch, batch_code: &str) -> LedgerResult<Batch> {
        let state = &mut *self.guard;
        if !state.batch_codes.insert(batch_code.to_string()) {
            return Err(LedgerError::validation(format!(
                "Batch code '{batch_code}' already exists"
            )));
        }
        state.next_batch_id += 1;
        let created = Batch {
            batch_id: state.next_batch_id,
            batch_code: batch_code.to_string(),
            product_code: batch.product_code.clone(),
            quantity_received: batch.quantity_received,
            unit_cost: batch.unit_cost.clone(),
            expiry_date: batch.expiry_date,
            received_at: Utc::now(),
        };
        state.batches.insert(created.batch_id, created.clone());
        Ok(created)
    }

    async fn find_batch(&mut self, batch_id: i64) -> LedgerResult<Option<Batch>> {
        Ok(self.guard.batches.get(&batch_id).cloned())
    }

    async fn latest_batch(&mut self, product_code: &str) -> LedgerResult<Option<Batch>> {
        Ok(self
            .guard
            .batches
            .values()
            .filter(|b| b.product_code == product_code)
            .max_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.batch_id.cmp(&b.batch_id))
            })
            .cloned())
    }

    async fn find_location(
        &mut self,
        location: LocationType,
    ) -> LedgerResult<Option<InventoryLocation>> {
        Ok(self.guard.locations.get(&location).cloned())
    }

    async fn lock_records(
        &mut self,
        product_code: &str,
        location: LocationType,
    ) -> LedgerResult<Vec<LocationInventoryRecord>> {
        let mut records: Vec<_> = self
            .guard
            .product_records(product_code)
            .filter(|r| r.location == location)
            .cloned()
            .collect();
        records.sort_by(LocationInventoryRecord::allocation_order);
        Ok(records)
    }

    async fn add_quantity(
        &mut self,
        batch_id: i64,
        location: LocationType,
        delta: i32,
        limits: LocationLimits,
    ) -> LedgerResult<i32> {
        FaultPlan::trip(&self.faults.fail_add_quantity, "add_quantity")?;
        let state = &mut *self.guard;
        let batch = state
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("Batch", batch_id.to_string()))?;

        let (current, capacity) = match state.records.get(&(batch_id, location)) {
            Some(record) => (record.quantity, record.capacity),
            None => (0, limits.capacity),
        };
        let resulting = current
            .checked_add(delta)
            .ok_or(LedgerError::CapacityExceeded {
                batch_id,
                location,
                resulting: i32::MAX,
                capacity,
            })?;
        if resulting < 0 {
            return Err(LedgerError::validation(format!(
                "Batch {batch_id} at {location} holds {current}, cannot apply {delta}"
            )));
        }
        if resulting > capacity {
            return Err(LedgerError::CapacityExceeded {
                batch_id,
                location,
                resulting,
                capacity,
            });
        }

        match state.records.get_mut(&(batch_id, location)) {
            Some(record) => record.quantity = resulting,
            None => {
                state.next_record_id += 1;
                state.records.insert(
                    (batch_id, location),
                    LocationInventoryRecord {
                        record_id: state.next_record_id,
                        batch_id,
                        product_code: batch.product_code,
                        location,
                        quantity: resulting,
                        capacity: limits.capacity,
                        safety_floor: limits.safety_floor,
                        expiry_date: batch.expiry_date,
                        received_at: batch.received_at,
                    },
                );
            }
        }
        Ok(resulting)
    }

    async fn decrement_if_available(
        &mut self,
        batch_id: i64,
        location: LocationType,
        amount: i32,
    ) -> LedgerResult<u64> {
        match self.guard.records.get_mut(&(batch_id, location)) {
            Some(record) if record.quantity >= amount => {
                record.quantity -= amount;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn order_code_exists(&mut self, order_code: &str) -> LedgerResult<bool> {
        Ok(self.guard.orders.contains_key(order_code))
    }

    async fn insert_order(&mut self, order: &NewOrder) -> LedgerResult<Order> {
        let delay_ms = self.faults.insert_order_delay_ms.swap(0, Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        FaultPlan::trip(&self.faults.fail_insert_order, "insert_order")?;

        let state = &mut *self.guard;
        if state.orders.contains_key(&order.order_code) {
            return Err(LedgerError::DatabaseError(format!(
                "duplicate order code {}",
                order.order_code
            )));
        }
        state.next_order_id += 1;
        let created = Order {
            order_id: state.next_order_id,
            order_code: order.order_code.clone(),
            session_id: order.session_id.clone(),
            customer: order.customer.clone(),
            items: order.items.clone(),
            subtotal: order.subtotal.clone(),
            total: order.total.clone(),
            created_at: Utc::now(),
        };
        state.orders.insert(created.order_code.clone(), created.clone());
        Ok(created)
    }

    async fn supersede_alerts(&mut self, product_code: &str) -> LedgerResult<u64> {
        let mut changed = 0;
        for alert in self.guard.alerts.values_mut() {
            if alert.product_code == product_code && alert.status == AlertStatus::Open {
                alert.status = AlertStatus::Superseded;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert_alert(&mut self, alert: &NewAlert) -> LedgerResult<ReorderAlert> {
        let state = &mut *self.guard;
        state.next_alert_id += 1;
        let created = ReorderAlert {
            alert_id: state.next_alert_id,
            product_code: alert.product_code.clone(),
            current_stock: alert.current_stock,
            threshold: alert.threshold,
            tier: alert.tier,
            severity: alert.severity,
            status: AlertStatus::Open,
            created_at: Utc::now(),
        };
        state.alerts.insert(created.alert_id, created.clone());
        Ok(created)
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        // Drop restores the snapshot
        Ok(())
    }
}
