//! Shared fixtures for service and handler tests

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::LedgerSettings;
use crate::database::memory::MemoryLedgerStore;
use crate::database::store::LedgerStore;
use crate::models::inventory::{DiscountRule, LocationLimits, LocationType, Product};
use crate::models::order::CustomerInfo;
use crate::services::batch_ledger::ReceiveStockRequest;
use crate::services::Ledger;

pub fn product(code: &str, price: &str) -> Product {
    Product {
        product_code: code.to_string(),
        name: format!("Product {code}"),
        category: None,
        base_price: BigDecimal::from_str(price).unwrap(),
        discount: DiscountRule::None,
        reorder_capacity: None,
        is_active: true,
    }
}

pub fn limits(capacity: i32) -> LocationLimits {
    LocationLimits {
        capacity,
        safety_floor: 0,
    }
}

pub fn customer() -> CustomerInfo {
    CustomerInfo {
        name: "Somchai Jaidee".to_string(),
        email: "somchai@example.com".to_string(),
        phone: "+66 81 234 5678".to_string(),
        shipping_address: "99 Sukhumvit Rd, Bangkok".to_string(),
    }
}

pub struct Fixture {
    pub store: MemoryLedgerStore,
    pub ledger: Ledger,
}

impl Fixture {
    /// P1 and P2 active (P2 with a configured reorder capacity), P3 inactive
    pub async fn new() -> Self {
        Self::with_settings(LedgerSettings::default()).await
    }

    pub async fn with_settings(settings: LedgerSettings) -> Self {
        let store = MemoryLedgerStore::new();
        let mut p2 = product("P2", "25.00");
        p2.reorder_capacity = Some(200);
        let mut p3 = product("P3", "5.00");
        p3.is_active = false;
        store
            .load_products(vec![product("P1", "10.00"), p2, p3])
            .await;

        let shared: Arc<dyn LedgerStore> = Arc::new(store.clone());
        Self {
            ledger: Ledger::new(shared, &settings),
            store,
        }
    }

    /// Receives a lot with no expiry; returns its batch id
    pub async fn receive(&self, code: &str, location: LocationType, quantity: i32) -> i64 {
        self.receive_expiring(code, location, quantity, None).await
    }

    pub async fn receive_expiring(
        &self,
        code: &str,
        location: LocationType,
        quantity: i32,
        expiry_date: Option<NaiveDate>,
    ) -> i64 {
        self.ledger
            .batches
            .receive_stock(ReceiveStockRequest {
                product_code: code.to_string(),
                quantity,
                unit_cost: BigDecimal::from(1),
                expiry_date,
                location,
                reason: None,
            })
            .await
            .unwrap()
            .batch
            .batch_id
    }
}
