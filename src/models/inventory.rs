use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// The fixed set of stocking points quantities are tracked at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    Warehouse,
    Shelf,
    Online,
}

impl LocationType {
    pub const ALL: [LocationType; 3] = [
        LocationType::Warehouse,
        LocationType::Shelf,
        LocationType::Online,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            LocationType::Warehouse => "WAREHOUSE",
            LocationType::Shelf => "SHELF",
            LocationType::Online => "ONLINE",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for LocationType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WAREHOUSE" => Ok(LocationType::Warehouse),
            "SHELF" => Ok(LocationType::Shelf),
            "ONLINE" => Ok(LocationType::Online),
            _ => Err(LedgerError::not_found("Location", s.trim())),
        }
    }
}

/// Registry entry for a stocking point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryLocation {
    pub location_id: i32,
    pub code: LocationType,
    pub name: String,
    pub is_active: bool,
}

/// Discount applied to a product's base price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountRule {
    None,
    Amount(BigDecimal),
    Percent(BigDecimal),
}

impl DiscountRule {
    pub fn discount_for(&self, base_price: &BigDecimal) -> BigDecimal {
        match self {
            DiscountRule::None => BigDecimal::zero(),
            DiscountRule::Amount(amount) => amount.clone(),
            DiscountRule::Percent(percent) => {
                (base_price * percent / BigDecimal::from(100)).with_scale(2)
            }
        }
    }
}

/// Catalog view of a sellable SKU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_code: String,
    pub name: String,
    pub category: Option<String>,
    pub base_price: BigDecimal,
    pub discount: DiscountRule,
    /// Estimated capacity used by the reorder advisor; falls back to the configured default
    pub reorder_capacity: Option<i32>,
    pub is_active: bool,
}

impl Product {
    /// Base price minus discount, never below zero
    pub fn final_price(&self) -> BigDecimal {
        let price = &self.base_price - self.discount.discount_for(&self.base_price);
        if price < BigDecimal::zero() {
            BigDecimal::zero()
        } else {
            price
        }
    }
}

/// One received lot of a product. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: i64,
    pub batch_code: String,
    pub product_code: String,
    pub quantity_received: i32,
    pub unit_cost: BigDecimal,
    pub expiry_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub product_code: String,
    pub quantity_received: i32,
    pub unit_cost: BigDecimal,
    pub expiry_date: Option<NaiveDate>,
}

/// Current quantity of one batch at one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInventoryRecord {
    pub record_id: i64,
    pub batch_id: i64,
    pub product_code: String,
    pub location: LocationType,
    pub quantity: i32,
    pub capacity: i32,
    pub safety_floor: i32,
    pub expiry_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
}

impl LocationInventoryRecord {
    /// First-expiring first, undated lots last, then oldest received
    pub fn allocation_order(a: &Self, b: &Self) -> Ordering {
        let expiry = match (a.expiry_date, b.expiry_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        expiry
            .then_with(|| a.received_at.cmp(&b.received_at))
            .then_with(|| a.batch_id.cmp(&b.batch_id))
    }
}

/// Capacity and safety floor applied when a record is first created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationLimits {
    pub capacity: i32,
    pub safety_floor: i32,
}

/// Portion of a product-level decrement taken from one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAllocation {
    pub batch_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Receipt,
    Transfer,
    Adjustment,
    Sale,
}

impl MovementKind {
    pub fn code(&self) -> &'static str {
        match self {
            MovementKind::Receipt => "RECEIPT",
            MovementKind::Transfer => "TRANSFER",
            MovementKind::Adjustment => "ADJUSTMENT",
            MovementKind::Sale => "SALE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RECEIPT" => Some(MovementKind::Receipt),
            "TRANSFER" => Some(MovementKind::Transfer),
            "ADJUSTMENT" => Some(MovementKind::Adjustment),
            "SALE" => Some(MovementKind::Sale),
            _ => None,
        }
    }
}

/// Audit entry for a quantity change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockMovement {
    pub movement_id: i64,
    pub product_code: String,
    pub batch_id: Option<i64>,
    pub from_location: Option<LocationType>,
    pub to_location: Option<LocationType>,
    pub quantity: i32,
    pub kind: MovementKind,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMovement {
    pub product_code: String,
    pub batch_id: Option<i64>,
    pub from_location: Option<LocationType>,
    pub to_location: Option<LocationType>,
    pub quantity: i32,
    pub kind: MovementKind,
    pub reason: String,
}

/// Sales over the velocity window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesVelocity {
    pub transactions: i32,
    pub units_sold: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiringBatch {
    pub batch: Batch,
    pub remaining_quantity: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn product(base: &str, discount: DiscountRule) -> Product {
        Product {
            product_code: "P1".to_string(),
            name: "Widget".to_string(),
            category: None,
            base_price: BigDecimal::from_str(base).unwrap(),
            discount,
            reorder_capacity: None,
            is_active: true,
        }
    }

    #[test]
    fn location_codes_parse_case_insensitively() {
        assert_eq!("shelf".parse::<LocationType>().unwrap(), LocationType::Shelf);
        assert_eq!(" ONLINE ".parse::<LocationType>().unwrap(), LocationType::Online);
        assert!(matches!(
            "BACKROOM".parse::<LocationType>(),
            Err(LedgerError::NotFound { entity: "Location", .. })
        ));
    }

    #[test]
    fn final_price_applies_discount_and_never_goes_negative() {
        let p = product("10.00", DiscountRule::Amount(BigDecimal::from_str("2.50").unwrap()));
        assert_eq!(p.final_price(), BigDecimal::from_str("7.50").unwrap());

        let p = product("80.00", DiscountRule::Percent(BigDecimal::from(25)));
        assert_eq!(p.final_price(), BigDecimal::from_str("60.00").unwrap());

        let p = product("5.00", DiscountRule::Amount(BigDecimal::from(9)));
        assert_eq!(p.final_price(), BigDecimal::zero());
    }

    #[test]
    fn allocation_order_prefers_earliest_expiry_then_oldest_receipt() {
        let received = |day| Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap();
        let record = |batch_id, expiry: Option<NaiveDate>, day| LocationInventoryRecord {
            record_id: batch_id,
            batch_id,
            product_code: "P1".to_string(),
            location: LocationType::Shelf,
            quantity: 1,
            capacity: 10,
            safety_floor: 0,
            expiry_date: expiry,
            received_at: received(day),
        };

        let mut records = vec![
            record(1, None, 1),
            record(2, NaiveDate::from_ymd_opt(2026, 6, 1), 5),
            record(3, NaiveDate::from_ymd_opt(2026, 3, 1), 9),
            record(4, None, 2),
        ];
        records.sort_by(LocationInventoryRecord::allocation_order);

        let order: Vec<i64> = records.iter().map(|r| r.batch_id).collect();
        assert_eq!(order, vec![3, 2, 1, 4]);
    }
}
