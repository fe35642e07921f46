//! SQL Server ledger store.
//!
//! Each transaction pins one pooled connection for its whole life. Rows that
//! will be mutated are read `WITH (UPDLOCK, ROWLOCK)` so concurrent writers
//! queue behind the first; stock leaves a record only through the conditional
//! decrement in `decrement_if_available`.

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_tiberius::ConnectionManager;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;
use tiberius::{Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::{debug, error, warn};

use super::store::{LedgerStore, LedgerTx};
use super::Database;
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::{
    Batch, DiscountRule, ExpiringBatch, InventoryLocation, LocationInventoryRecord,
    LocationLimits, LocationType, MovementKind, NewBatch, NewMovement, Product, SalesVelocity,
    StockMovement,
};
use crate::models::order::{CustomerInfo, NewOrder, Order, OrderItem};
use crate::models::reorder::{
    AlertSeverity, AlertStatus, NewAlert, ReorderAlert, VelocityTier,
};

type Client = tiberius::Client<Compat<TcpStream>>;
type OwnedConnection = PooledConnection<'static, ConnectionManager>;

/// Tables the ledger reads and writes
pub const LEDGER_TABLES: [&str; 8] = [
    "Product",
    "Batch",
    "InventoryLocation",
    "LocationInventory",
    "StockMovement",
    "ReorderAlert",
    "SalesOrder",
    "SalesOrderItem",
];

// Decimal columns are read back as text so precision survives the trip
/// Pooled connections outlive the transaction; these put the session back
/// on the server defaults (READ COMMITTED) for the next borrower
const COMMIT_TRANSACTION: &str =
    "COMMIT; SET TRANSACTION ISOLATION LEVEL READ COMMITTED; SET XACT_ABORT OFF";
const ROLLBACK_TRANSACTION: &str =
    "IF @@TRANCOUNT > 0 ROLLBACK; SET TRANSACTION ISOLATION LEVEL READ COMMITTED; SET XACT_ABORT OFF";

const PRODUCT_SELECT: &str = r#"
    SELECT ProductCode, Name, Category,
           CAST(BasePrice AS NVARCHAR(40)) AS BasePrice,
           DiscountType,
           CAST(DiscountValue AS NVARCHAR(40)) AS DiscountValue,
           ReorderCapacity, IsActive
    FROM Product WITH (NOLOCK)
"#;

const BATCH_SELECT: &str = r#"
    SELECT BatchId, BatchCode, ProductCode, QtyReceived,
           CAST(UnitCost AS NVARCHAR(40)) AS UnitCost, ExpiryDate, ReceivedAt
    FROM Batch
"#;

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn text(row: &Row, column: &str) -> String {
    row.get::<&str, _>(column).unwrap_or("").trim().to_string()
}

fn decimal(row: &Row, column: &str) -> LedgerResult<BigDecimal> {
    let raw = row.get::<&str, _>(column).unwrap_or("0");
    BigDecimal::from_str(raw.trim()).map_err(|e| {
        LedgerError::DatabaseError(format!("Column {column} holds '{raw}', not a decimal: {e}"))
    })
}

fn utc(row: &Row, column: &str) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(
        row.get::<NaiveDateTime, _>(column).unwrap_or_default(),
        Utc,
    )
}

fn location(row: &Row, column: &str) -> LedgerResult<LocationType> {
    let code = text(row, column);
    code.parse()
        .map_err(|_| LedgerError::DatabaseError(format!("Unknown location code '{code}' in {column}")))
}

fn optional_location(row: &Row, column: &str) -> LedgerResult<Option<LocationType>> {
    match row.get::<&str, _>(column) {
        Some(code) if !code.trim().is_empty() => location(row, column).map(Some),
        _ => Ok(None),
    }
}

fn coded<T>(row: &Row, column: &str, parse: fn(&str) -> Option<T>) -> LedgerResult<T> {
    let code = text(row, column);
    parse(&code).ok_or_else(|| LedgerError::DatabaseError(format!("Unknown {column} '{code}'")))
}

fn product_from_row(row: &Row) -> LedgerResult<Product> {
    let discount = match text(row, "DiscountType").as_str() {
        "AMOUNT" => DiscountRule::Amount(decimal(row, "DiscountValue")?),
        "PERCENT" => DiscountRule::Percent(decimal(row, "DiscountValue")?),
        _ => DiscountRule::None,
    };
    Ok(Product {
        product_code: text(row, "ProductCode"),
        name: text(row, "Name"),
        category: row.get::<&str, _>("Category").map(|c| c.trim().to_string()),
        base_price: decimal(row, "BasePrice")?,
        discount,
        reorder_capacity: row.get::<i32, _>("ReorderCapacity"),
        is_active: row.get::<bool, _>("IsActive").unwrap_or(false),
    })
}

fn batch_from_row(row: &Row) -> LedgerResult<Batch> {
    Ok(Batch {
        batch_id: row.get::<i64, _>("BatchId").unwrap_or(0),
        batch_code: text(row, "BatchCode"),
        product_code: text(row, "ProductCode"),
        quantity_received: row.get::<i32, _>("QtyReceived").unwrap_or(0),
        unit_cost: decimal(row, "UnitCost")?,
        expiry_date: row.get::<NaiveDate, _>("ExpiryDate"),
        received_at: utc(row, "ReceivedAt"),
    })
}

fn record_from_row(row: &Row) -> LedgerResult<LocationInventoryRecord> {
    Ok(LocationInventoryRecord {
        record_id: row.get::<i64, _>("RecordId").unwrap_or(0),
        batch_id: row.get::<i64, _>("BatchId").unwrap_or(0),
        product_code: text(row, "ProductCode"),
        location: location(row, "LocationCode")?,
        quantity: row.get::<i32, _>("QtyOnHand").unwrap_or(0),
        capacity: row.get::<i32, _>("Capacity").unwrap_or(0),
        safety_floor: row.get::<i32, _>("SafetyFloor").unwrap_or(0),
        expiry_date: row.get::<NaiveDate, _>("ExpiryDate"),
        received_at: utc(row, "ReceivedAt"),
    })
}

fn location_entry_from_row(row: &Row) -> LedgerResult<InventoryLocation> {
    Ok(InventoryLocation {
        location_id: row.get::<i32, _>("LocationId").unwrap_or(0),
        code: location(row, "Code")?,
        name: text(row, "Name"),
        is_active: row.get::<bool, _>("IsActive").unwrap_or(false),
    })
}

fn movement_from_row(row: &Row) -> LedgerResult<StockMovement> {
    Ok(StockMovement {
        movement_id: row.get::<i64, _>("MovementId").unwrap_or(0),
        product_code: text(row, "ProductCode"),
        batch_id: row.get::<i64, _>("BatchId"),
        from_location: optional_location(row, "FromLocation")?,
        to_location: optional_location(row, "ToLocation")?,
        quantity: row.get::<i32, _>("Quantity").unwrap_or(0),
        kind: coded(row, "MovementType", MovementKind::from_code)?,
        reason: text(row, "Reason"),
        recorded_at: utc(row, "RecordedAt"),
    })
}

fn alert_from_row(row: &Row) -> LedgerResult<ReorderAlert> {
    Ok(ReorderAlert {
        alert_id: row.get::<i64, _>("AlertId").unwrap_or(0),
        product_code: text(row, "ProductCode"),
        current_stock: row.get::<i32, _>("CurrentStock").unwrap_or(0),
        threshold: row.get::<i32, _>("Threshold").unwrap_or(0),
        tier: coded(row, "Tier", VelocityTier::from_code)?,
        severity: coded(row, "Severity", AlertSeverity::from_code)?,
        status: coded(row, "Status", AlertStatus::from_code)?,
        created_at: utc(row, "CreatedAt"),
    })
}

// ---------------------------------------------------------------------------
// Query helpers shared by pooled reads and transactions
// ---------------------------------------------------------------------------

async fn fetch_all(client: &mut Client, sql: &str, params: &[&dyn ToSql]) -> LedgerResult<Vec<Row>> {
    Ok(client.query(sql, params).await?.into_first_result().await?)
}

async fn fetch_one(client: &mut Client, sql: &str, params: &[&dyn ToSql]) -> LedgerResult<Option<Row>> {
    Ok(client.query(sql, params).await?.into_row().await?)
}

async fn select_product(client: &mut Client, product_code: &str) -> LedgerResult<Option<Product>> {
    let sql = format!("{PRODUCT_SELECT} WHERE ProductCode = @P1");
    fetch_one(client, &sql, &[&product_code])
        .await?
        .as_ref()
        .map(product_from_row)
        .transpose()
}

async fn select_batch(client: &mut Client, batch_id: i64) -> LedgerResult<Option<Batch>> {
    let sql = format!("{BATCH_SELECT} WHERE BatchId = @P1");
    fetch_one(client, &sql, &[&batch_id])
        .await?
        .as_ref()
        .map(batch_from_row)
        .transpose()
}

async fn select_order(client: &mut Client, order_code: &str) -> LedgerResult<Option<Order>> {
    let header = fetch_one(
        client,
        r#"
            SELECT OrderId, OrderCode, SessionId, CustomerName, CustomerEmail,
                   CustomerPhone, ShippingAddress,
                   CAST(Subtotal AS NVARCHAR(40)) AS Subtotal,
                   CAST(Total AS NVARCHAR(40)) AS Total, CreatedAt
            FROM SalesOrder
            WHERE OrderCode = @P1
        "#,
        &[&order_code],
    )
    .await?;
    let Some(header) = header else {
        return Ok(None);
    };
    let order_id = header.get::<i64, _>("OrderId").unwrap_or(0);

    let lines = fetch_all(
        client,
        r#"
            SELECT ProductCode, Quantity,
                   CAST(UnitPrice AS NVARCHAR(40)) AS UnitPrice,
                   CAST(LineTotal AS NVARCHAR(40)) AS LineTotal
            FROM SalesOrderItem
            WHERE OrderId = @P1
            ORDER BY LineNumber
        "#,
        &[&order_id],
    )
    .await?;
    let items = lines
        .iter()
        .map(|row| {
            Ok(OrderItem {
                product_code: text(row, "ProductCode"),
                quantity: row.get::<i32, _>("Quantity").unwrap_or(0),
                unit_price: decimal(row, "UnitPrice")?,
                line_total: decimal(row, "LineTotal")?,
            })
        })
        .collect::<LedgerResult<Vec<_>>>()?;

    Ok(Some(Order {
        order_id,
        order_code: text(&header, "OrderCode"),
        session_id: text(&header, "SessionId"),
        customer: CustomerInfo {
            name: text(&header, "CustomerName"),
            email: text(&header, "CustomerEmail"),
            phone: text(&header, "CustomerPhone"),
            shipping_address: text(&header, "ShippingAddress"),
        },
        items,
        subtotal: decimal(&header, "Subtotal")?,
        total: decimal(&header, "Total")?,
        created_at: utc(&header, "CreatedAt"),
    }))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SqlServerLedgerStore {
    db: Database,
}

impl SqlServerLedgerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn client(&self) -> LedgerResult<OwnedConnection> {
        self.db
            .get_owned_client()
            .await
            .map_err(|e| LedgerError::DatabaseError(e.to_string()))
    }
}

#[async_trait]
impl LedgerStore for SqlServerLedgerStore {
    fn backend_name(&self) -> &str {
        "sqlserver"
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let mut conn = self.client().await?;
        conn.simple_query("SET XACT_ABORT ON").await?.into_results().await?;
        conn.simple_query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await?
            .into_results()
            .await?;
        conn.simple_query("BEGIN TRANSACTION").await?.into_results().await?;
        Ok(Box::new(SqlServerTx {
            conn: Some(conn),
        }))
    }

    async fn find_product(&self, product_code: &str) -> LedgerResult<Option<Product>> {
        let mut conn = self.client().await?;
        select_product(&mut conn, product_code).await
    }

    async fn list_active_products(&self) -> LedgerResult<Vec<Product>> {
        let mut conn = self.client().await?;
        let sql = format!("{PRODUCT_SELECT} WHERE IsActive = 1 ORDER BY ProductCode");
        fetch_all(&mut conn, &sql, &[])
            .await?
            .iter()
            .map(product_from_row)
            .collect()
    }

    async fn list_locations(&self) -> LedgerResult<Vec<InventoryLocation>> {
        let mut conn = self.client().await?;
        fetch_all(
            &mut conn,
            "SELECT LocationId, Code, Name, IsActive FROM InventoryLocation WITH (NOLOCK) ORDER BY LocationId",
            &[],
        )
        .await?
        .iter()
        .map(location_entry_from_row)
        .collect()
    }

    async fn find_batch(&self, batch_id: i64) -> LedgerResult<Option<Batch>> {
        let mut conn = self.client().await?;
        select_batch(&mut conn, batch_id).await
    }

    async fn quantity_at(&self, product_code: &str, location: LocationType) -> LedgerResult<i32> {
        let mut conn = self.client().await?;
        let row = fetch_one(
            &mut conn,
            r#"
                SELECT COALESCE(SUM(r.QtyOnHand), 0) AS Total
                FROM LocationInventory r
                JOIN Batch b ON b.BatchId = r.BatchId
                WHERE b.ProductCode = @P1 AND r.LocationCode = @P2
            "#,
            &[&product_code, &location.code()],
        )
        .await?;
        Ok(row.and_then(|r| r.get::<i32, _>("Total")).unwrap_or(0))
    }

    async fn quantity_by_location(
        &self,
        product_code: &str,
    ) -> LedgerResult<BTreeMap<LocationType, i32>> {
        let mut conn = self.client().await?;
        let rows = fetch_all(
            &mut conn,
            r#"
                SELECT r.LocationCode, SUM(r.QtyOnHand) AS Total
                FROM LocationInventory r
                JOIN Batch b ON b.BatchId = r.BatchId
                WHERE b.ProductCode = @P1
                GROUP BY r.LocationCode
            "#,
            &[&product_code],
        )
        .await?;

        let mut totals: BTreeMap<LocationType, i32> =
            LocationType::ALL.iter().map(|l| (*l, 0)).collect();
        for row in &rows {
            totals.insert(
                location(row, "LocationCode")?,
                row.get::<i32, _>("Total").unwrap_or(0),
            );
        }
        Ok(totals)
    }

    async fn list_records(&self, product_code: &str) -> LedgerResult<Vec<LocationInventoryRecord>> {
        let mut conn = self.client().await?;
        let rows = fetch_all(
            &mut conn,
            r#"
                SELECT r.RecordId, r.BatchId, b.ProductCode, r.LocationCode, r.QtyOnHand,
                       r.Capacity, r.SafetyFloor, b.ExpiryDate, b.ReceivedAt
                FROM LocationInventory r
                JOIN Batch b ON b.BatchId = r.BatchId
                WHERE b.ProductCode = @P1
            "#,
            &[&product_code],
        )
        .await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
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
        let mut conn = self.client().await?;
        let since = since.naive_utc();
        let row = fetch_one(
            &mut conn,
            r#"
                SELECT COUNT(DISTINCT o.OrderId) AS Transactions,
                       COALESCE(SUM(i.Quantity), 0) AS UnitsSold
                FROM SalesOrderItem i
                JOIN SalesOrder o ON o.OrderId = i.OrderId
                WHERE i.ProductCode = @P1 AND o.CreatedAt >= @P2
            "#,
            &[&product_code, &since],
        )
        .await?;
        Ok(row
            .map(|r| SalesVelocity {
                transactions: r.get::<i32, _>("Transactions").unwrap_or(0),
                units_sold: r.get::<i32, _>("UnitsSold").unwrap_or(0),
            })
            .unwrap_or_default())
    }

    async fn expiring_batches(&self, on_or_before: NaiveDate) -> LedgerResult<Vec<ExpiringBatch>> {
        let mut conn = self.client().await?;
        let rows = fetch_all(
            &mut conn,
            r#"
                SELECT b.BatchId, b.BatchCode, b.ProductCode, b.QtyReceived,
                       CAST(b.UnitCost AS NVARCHAR(40)) AS UnitCost, b.ExpiryDate, b.ReceivedAt,
                       SUM(r.QtyOnHand) AS Remaining
                FROM Batch b
                JOIN LocationInventory r ON r.BatchId = b.BatchId
                WHERE b.ExpiryDate IS NOT NULL AND b.ExpiryDate <= @P1
                GROUP BY b.BatchId, b.BatchCode, b.ProductCode, b.QtyReceived,
                         b.UnitCost, b.ExpiryDate, b.ReceivedAt
                HAVING SUM(r.QtyOnHand) > 0
                ORDER BY b.ExpiryDate, b.BatchId
            "#,
            &[&on_or_before],
        )
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ExpiringBatch {
                    batch: batch_from_row(row)?,
                    remaining_quantity: row.get::<i32, _>("Remaining").unwrap_or(0),
                })
            })
            .collect()
    }

    async fn record_movement(&self, movement: &NewMovement) -> LedgerResult<StockMovement> {
        let mut conn = self.client().await?;
        let from = movement.from_location.map(|l| l.code());
        let to = movement.to_location.map(|l| l.code());
        let row = fetch_one(
            &mut conn,
            r#"
                INSERT INTO StockMovement
                    (ProductCode, BatchId, FromLocation, ToLocation, Quantity, MovementType, Reason, RecordedAt)
                OUTPUT INSERTED.MovementId, INSERTED.RecordedAt
                VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, SYSUTCDATETIME())
            "#,
            &[
                &movement.product_code.as_str(),
                &movement.batch_id,
                &from,
                &to,
                &movement.quantity,
                &movement.kind.code(),
                &movement.reason.as_str(),
            ],
        )
        .await?
        .ok_or_else(|| LedgerError::DatabaseError("Movement insert returned no row".to_string()))?;

        Ok(StockMovement {
            movement_id: row.get::<i64, _>("MovementId").unwrap_or(0),
            product_code: movement.product_code.clone(),
            batch_id: movement.batch_id,
            from_location: movement.from_location,
            to_location: movement.to_location,
            quantity: movement.quantity,
            kind: movement.kind,
            reason: movement.reason.clone(),
            recorded_at: utc(&row, "RecordedAt"),
        })
    }

    async fn list_movements(
        &self,
        product_code: &str,
        limit: u32,
    ) -> LedgerResult<Vec<StockMovement>> {
        let mut conn = self.client().await?;
        let limit = i64::from(limit);
        fetch_all(
            &mut conn,
            r#"
                SELECT TOP (@P2) MovementId, ProductCode, BatchId, FromLocation, ToLocation,
                       Quantity, MovementType, Reason, RecordedAt
                FROM StockMovement WITH (NOLOCK)
                WHERE ProductCode = @P1
                ORDER BY RecordedAt DESC, MovementId DESC
            "#,
            &[&product_code, &limit],
        )
        .await?
        .iter()
        .map(movement_from_row)
        .collect()
    }

    async fn list_alerts(&self, status: Option<AlertStatus>) -> LedgerResult<Vec<ReorderAlert>> {
        let mut conn = self.client().await?;
        let status = status.map(|s| s.code());
        fetch_all(
            &mut conn,
            r#"
                SELECT AlertId, ProductCode, CurrentStock, Threshold, Tier, Severity, Status, CreatedAt
                FROM ReorderAlert
                WHERE @P1 IS NULL OR Status = @P1
                ORDER BY AlertId
            "#,
            &[&status],
        )
        .await?
        .iter()
        .map(alert_from_row)
        .collect()
    }

    async fn find_alert(&self, alert_id: i64) -> LedgerResult<Option<ReorderAlert>> {
        let mut conn = self.client().await?;
        fetch_one(
            &mut conn,
            r#"
                SELECT AlertId, ProductCode, CurrentStock, Threshold, Tier, Severity, Status, CreatedAt
                FROM ReorderAlert
                WHERE AlertId = @P1
            "#,
            &[&alert_id],
        )
        .await?
        .as_ref()
        .map(alert_from_row)
        .transpose()
    }

    async fn resolve_alert(&self, alert_id: i64) -> LedgerResult<bool> {
        let mut conn = self.client().await?;
        let result = conn
            .execute(
                "UPDATE ReorderAlert SET Status = @P1 WHERE AlertId = @P2 AND Status = @P3",
                &[
                    &AlertStatus::Resolved.code(),
                    &alert_id,
                    &AlertStatus::Open.code(),
                ],
            )
            .await?;
        Ok(result.total() > 0)
    }

    async fn find_order(&self, order_code: &str) -> LedgerResult<Option<Order>> {
        let mut conn = self.client().await?;
        select_order(&mut conn, order_code).await
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

pub struct SqlServerTx {
    /// `None` once committed or rolled back
    conn: Option<OwnedConnection>,
}

impl SqlServerTx {
    fn client(&mut self) -> LedgerResult<&mut Client> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| LedgerError::TransactionFailed("transaction already finished".to_string()))
    }
}

impl Drop for SqlServerTx {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // Abandoned mid-flight (error path or checkout timeout)
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let rolled_back: Result<_, tiberius::error::Error> = async {
                        conn.simple_query(ROLLBACK_TRANSACTION).await?.into_results().await
                    }
                    .await;
                    if let Err(e) = rolled_back {
                        error!("❌ Rollback of abandoned transaction failed: {}", e);
                    } else {
                        warn!("↩️ Abandoned transaction rolled back");
                    }
                });
            }
            Err(_) => error!("❌ Transaction dropped outside a runtime; connection discarded"),
        }
    }
}

#[async_trait]
impl LedgerTx for SqlServerTx {
    async fn insert_batch(&mut self, batch: &NewBatch, batch_code: &str) -> LedgerResult<Batch> {
        let client = self.client()?;
        let taken = fetch_one(
            client,
            "SELECT COUNT(*) AS Taken FROM Batch WITH (UPDLOCK, HOLDLOCK) WHERE BatchCode = @P1",
            &[&batch_code],
        )
        .await?
        .and_then(|r| r.get::<i32, _>("Taken"))
        .unwrap_or(0);
        if taken > 0 {
            return Err(LedgerError::validation(format!(
                "Batch code '{batch_code}' already exists"
            )));
        }

        let unit_cost = batch.unit_cost.to_string();
        let row = fetch_one(
            client,
            r#"
                INSERT INTO Batch (BatchCode, ProductCode, QtyReceived, UnitCost, ExpiryDate, ReceivedAt)
                OUTPUT INSERTED.BatchId, INSERTED.ReceivedAt
                VALUES (@P1, @P2, @P3, CAST(@P4 AS DECIMAL(18, 4)), @P5, SYSUTCDATETIME())
            "#,
            &[
                &batch_code,
                &batch.product_code.as_str(),
                &batch.quantity_received,
                &unit_cost.as_str(),
                &batch.expiry_date,
            ],
        )
        .await?
        .ok_or_else(|| LedgerError::DatabaseError("Batch insert returned no row".to_string()))?;

        Ok(Batch {
            batch_id: row.get::<i64, _>("BatchId").unwrap_or(0),
            batch_code: batch_code.to_string(),
            product_code: batch.product_code.clone(),
            quantity_received: batch.quantity_received,
            unit_cost: batch.unit_cost.clone(),
            expiry_date: batch.expiry_date,
            received_at: utc(&row, "ReceivedAt"),
        })
    }

    async fn find_batch(&mut self, batch_id: i64) -> LedgerResult<Option<Batch>> {
        select_batch(self.client()?, batch_id).await
    }

    async fn latest_batch(&mut self, product_code: &str) -> LedgerResult<Option<Batch>> {
        let sql = format!(
            "{BATCH_SELECT} WHERE BatchId = (SELECT TOP 1 BatchId FROM Batch WHERE ProductCode = @P1 ORDER BY ReceivedAt DESC, BatchId DESC)"
        );
        fetch_one(self.client()?, &sql, &[&product_code])
            .await?
            .as_ref()
            .map(batch_from_row)
            .transpose()
    }

    async fn find_location(
        &mut self,
        location: LocationType,
    ) -> LedgerResult<Option<InventoryLocation>> {
        fetch_one(
            self.client()?,
            "SELECT LocationId, Code, Name, IsActive FROM InventoryLocation WHERE Code = @P1",
            &[&location.code()],
        )
        .await?
        .as_ref()
        .map(location_entry_from_row)
        .transpose()
    }

    async fn lock_records(
        &mut self,
        product_code: &str,
        location: LocationType,
    ) -> LedgerResult<Vec<LocationInventoryRecord>> {
        let rows = fetch_all(
            self.client()?,
            r#"
                SELECT r.RecordId, r.BatchId, b.ProductCode, r.LocationCode, r.QtyOnHand,
                       r.Capacity, r.SafetyFloor, b.ExpiryDate, b.ReceivedAt
                FROM LocationInventory r WITH (UPDLOCK, ROWLOCK)
                JOIN Batch b ON b.BatchId = r.BatchId
                WHERE b.ProductCode = @P1 AND r.LocationCode = @P2
                ORDER BY r.RecordId
            "#,
            &[&product_code, &location.code()],
        )
        .await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
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
        let client = self.client()?;
        if select_batch(client, batch_id).await?.is_none() {
            return Err(LedgerError::not_found("Batch", batch_id.to_string()));
        }

        let existing = fetch_one(
            client,
            r#"
                SELECT RecordId, QtyOnHand, Capacity
                FROM LocationInventory WITH (UPDLOCK, ROWLOCK)
                WHERE BatchId = @P1 AND LocationCode = @P2
            "#,
            &[&batch_id, &location.code()],
        )
        .await?;

        let (record_id, current, capacity) = match &existing {
            Some(row) => (
                row.get::<i64, _>("RecordId"),
                row.get::<i32, _>("QtyOnHand").unwrap_or(0),
                row.get::<i32, _>("Capacity").unwrap_or(limits.capacity),
            ),
            None => (None, 0, limits.capacity),
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

        match record_id {
            Some(record_id) => {
                client
                    .execute(
                        "UPDATE LocationInventory SET QtyOnHand = @P1 WHERE RecordId = @P2",
                        &[&resulting, &record_id],
                    )
                    .await?;
            }
            None => {
                client
                    .execute(
                        r#"
                            INSERT INTO LocationInventory (BatchId, LocationCode, QtyOnHand, Capacity, SafetyFloor)
                            VALUES (@P1, @P2, @P3, @P4, @P5)
                        "#,
                        &[
                            &batch_id,
                            &location.code(),
                            &resulting,
                            &limits.capacity,
                            &limits.safety_floor,
                        ],
                    )
                    .await?;
            }
        }
        debug!(batch_id, %location, delta, resulting, "LocationInventory upserted");
        Ok(resulting)
    }

    async fn decrement_if_available(
        &mut self,
        batch_id: i64,
        location: LocationType,
        amount: i32,
    ) -> LedgerResult<u64> {
        let result = self
            .client()?
            .execute(
                r#"
                    UPDATE LocationInventory
                    SET QtyOnHand = QtyOnHand - @P1
                    WHERE BatchId = @P2 AND LocationCode = @P3 AND QtyOnHand >= @P1
                "#,
                &[&amount, &batch_id, &location.code()],
            )
            .await?;
        Ok(result.total())
    }

    async fn order_code_exists(&mut self, order_code: &str) -> LedgerResult<bool> {
        let count = fetch_one(
            self.client()?,
            "SELECT COUNT(*) AS Taken FROM SalesOrder WITH (UPDLOCK, HOLDLOCK) WHERE OrderCode = @P1",
            &[&order_code],
        )
        .await?
        .and_then(|r| r.get::<i32, _>("Taken"))
        .unwrap_or(0);
        Ok(count > 0)
    }

    async fn insert_order(&mut self, order: &NewOrder) -> LedgerResult<Order> {
        let client = self.client()?;
        let subtotal = order.subtotal.to_string();
        let total = order.total.to_string();
        let header = fetch_one(
            client,
            r#"
                INSERT INTO SalesOrder
                    (OrderCode, SessionId, CustomerName, CustomerEmail, CustomerPhone,
                     ShippingAddress, Subtotal, Total, CreatedAt)
                OUTPUT INSERTED.OrderId, INSERTED.CreatedAt
                VALUES (@P1, @P2, @P3, @P4, @P5, @P6,
                        CAST(@P7 AS DECIMAL(18, 2)), CAST(@P8 AS DECIMAL(18, 2)), SYSUTCDATETIME())
            "#,
            &[
                &order.order_code.as_str(),
                &order.session_id.as_str(),
                &order.customer.name.as_str(),
                &order.customer.email.as_str(),
                &order.customer.phone.as_str(),
                &order.customer.shipping_address.as_str(),
                &subtotal.as_str(),
                &total.as_str(),
            ],
        )
        .await?
        .ok_or_else(|| LedgerError::DatabaseError("Order insert returned no row".to_string()))?;
        let order_id = header.get::<i64, _>("OrderId").unwrap_or(0);

        for (idx, item) in order.items.iter().enumerate() {
            let line_no = idx as i32 + 1;
            let unit_price = item.unit_price.to_string();
            let line_total = item.line_total.to_string();
            client
                .execute(
                    r#"
                        INSERT INTO SalesOrderItem (OrderId, LineNumber, ProductCode, Quantity, UnitPrice, LineTotal)
                        VALUES (@P1, @P2, @P3, @P4, CAST(@P5 AS DECIMAL(18, 2)), CAST(@P6 AS DECIMAL(18, 2)))
                    "#,
                    &[
                        &order_id,
                        &line_no,
                        &item.product_code.as_str(),
                        &item.quantity,
                        &unit_price.as_str(),
                        &line_total.as_str(),
                    ],
                )
                .await?;
        }

        Ok(Order {
            order_id,
            order_code: order.order_code.clone(),
            session_id: order.session_id.clone(),
            customer: order.customer.clone(),
            items: order.items.clone(),
            subtotal: order.subtotal.clone(),
            total: order.total.clone(),
            created_at: utc(&header, "CreatedAt"),
        })
    }

    async fn supersede_alerts(&mut self, product_code: &str) -> LedgerResult<u64> {
        let result = self
            .client()?
            .execute(
                "UPDATE ReorderAlert SET Status = @P1 WHERE ProductCode = @P2 AND Status = @P3",
                &[
                    &AlertStatus::Superseded.code(),
                    &product_code,
                    &AlertStatus::Open.code(),
                ],
            )
            .await?;
        Ok(result.total())
    }

    async fn insert_alert(&mut self, alert: &NewAlert) -> LedgerResult<ReorderAlert> {
        let row = fetch_one(
            self.client()?,
            r#"
                INSERT INTO ReorderAlert
                    (ProductCode, CurrentStock, Threshold, Tier, Severity, Status, CreatedAt)
                OUTPUT INSERTED.AlertId, INSERTED.CreatedAt
                VALUES (@P1, @P2, @P3, @P4, @P5, @P6, SYSUTCDATETIME())
            "#,
            &[
                &alert.product_code.as_str(),
                &alert.current_stock,
                &alert.threshold,
                &alert.tier.code(),
                &alert.severity.code(),
                &AlertStatus::Open.code(),
            ],
        )
        .await?
        .ok_or_else(|| LedgerError::DatabaseError("Alert insert returned no row".to_string()))?;

        Ok(ReorderAlert {
            alert_id: row.get::<i64, _>("AlertId").unwrap_or(0),
            product_code: alert.product_code.clone(),
            current_stock: alert.current_stock,
            threshold: alert.threshold,
            tier: alert.tier,
            severity: alert.severity,
            status: AlertStatus::Open,
            created_at: utc(&row, "CreatedAt"),
        })
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let mut tx = self;
        let mut conn = tx
            .conn
            .take()
            .ok_or_else(|| LedgerError::TransactionFailed("transaction already finished".to_string()))?;
        let committed: Result<_, tiberius::error::Error> =
            async { conn.simple_query(COMMIT_TRANSACTION).await?.into_results().await }.await;
        if let Err(e) = committed {
            let _: Result<_, tiberius::error::Error> = async {
                conn.simple_query(ROLLBACK_TRANSACTION).await?.into_results().await
            }
            .await;
            return Err(LedgerError::TransactionFailed(format!(
                "Failed to commit transaction: {e}"
            )));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        let mut tx = self;
        if let Some(mut conn) = tx.conn.take() {
            conn.simple_query(ROLLBACK_TRANSACTION)
                .await?
                .into_results()
                .await?;
        }
        Ok(())
    }
}
