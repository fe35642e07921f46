//! Storage seam for the ledger.
//!
//! `LedgerStore` exposes the read surface and hands out `LedgerTx` units of
//! work. Every quantity mutation goes through a transaction; the only write a
//! store performs outside one is the best-effort movement log.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

use crate::error::LedgerResult;
use crate::models::inventory::{
    Batch, ExpiringBatch, InventoryLocation, LocationInventoryRecord, LocationLimits,
    LocationType, NewBatch, NewMovement, Product, SalesVelocity, StockMovement,
};
use crate::models::order::{NewOrder, Order};
use crate::models::reorder::{AlertStatus, NewAlert, ReorderAlert};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short backend name for status endpoints and logs
    fn backend_name(&self) -> &str;

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>>;

    async fn find_product(&self, product_code: &str) -> LedgerResult<Option<Product>>;

    async fn list_active_products(&self) -> LedgerResult<Vec<Product>>;

    async fn list_locations(&self) -> LedgerResult<Vec<InventoryLocation>>;

    async fn find_batch(&self, batch_id: i64) -> LedgerResult<Option<Batch>>;

    /// Sum over every batch of the product at the location; 0 when nothing is recorded
    async fn quantity_at(&self, product_code: &str, location: LocationType) -> LedgerResult<i32>;

    async fn quantity_by_location(
        &self,
        product_code: &str,
    ) -> LedgerResult<BTreeMap<LocationType, i32>>;

    async fn list_records(&self, product_code: &str) -> LedgerResult<Vec<LocationInventoryRecord>>;

    async fn sales_velocity(
        &self,
        product_code: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<SalesVelocity>;

    async fn expiring_batches(&self, on_or_before: NaiveDate) -> LedgerResult<Vec<ExpiringBatch>>;

    async fn record_movement(&self, movement: &NewMovement) -> LedgerResult<StockMovement>;

    async fn list_movements(&self, product_code: &str, limit: u32)
        -> LedgerResult<Vec<StockMovement>>;

    async fn list_alerts(&self, status: Option<AlertStatus>) -> LedgerResult<Vec<ReorderAlert>>;

    async fn find_alert(&self, alert_id: i64) -> LedgerResult<Option<ReorderAlert>>;

    /// Returns false if the alert was not open
    async fn resolve_alert(&self, alert_id: i64) -> LedgerResult<bool>;

    async fn find_order(&self, order_code: &str) -> LedgerResult<Option<Order>>;
}

/// One unit of work. Dropping a transaction without `commit` rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Fails with `ValidationError` if the batch code is already taken
    async fn insert_batch(&mut self, batch: &NewBatch, batch_code: &str) -> LedgerResult<Batch>;

    async fn find_batch(&mut self, batch_id: i64) -> LedgerResult<Option<Batch>>;

    /// Most recently received lot of the product, if any
    async fn latest_batch(&mut self, product_code: &str) -> LedgerResult<Option<Batch>>;

    async fn find_location(&mut self, location: LocationType)
        -> LedgerResult<Option<InventoryLocation>>;

    /// Locks and returns the product's records at the location
    async fn lock_records(
        &mut self,
        product_code: &str,
        location: LocationType,
    ) -> LedgerResult<Vec<LocationInventoryRecord>>;

    /// Upserts the (batch, location) record and returns the resulting quantity.
    /// Fails if the result would be negative or exceed capacity.
    async fn add_quantity(
        &mut self,
        batch_id: i64,
        location: LocationType,
        delta: i32,
        limits: LocationLimits,
    ) -> LedgerResult<i32>;

    /// Atomic conditional decrement: reduces only when the record holds at
    /// least `amount`, returning the number of rows affected.
    async fn decrement_if_available(
        &mut self,
        batch_id: i64,
        location: LocationType,
        amount: i32,
    ) -> LedgerResult<u64>;

    async fn order_code_exists(&mut self, order_code: &str) -> LedgerResult<bool>;

    async fn insert_order(&mut self, order: &NewOrder) -> LedgerResult<Order>;

    /// Marks the product's open alerts superseded, returning how many changed
    async fn supersede_alerts(&mut self, product_code: &str) -> LedgerResult<u64>;

    async fn insert_alert(&mut self, alert: &NewAlert) -> LedgerResult<ReorderAlert>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}
