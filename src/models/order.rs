use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub shipping_address: String,
}

impl CustomerInfo {
    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.email.trim().is_empty() {
            missing.push("email");
        }
        if self.phone.trim().is_empty() {
            missing.push("phone");
        }
        if self.shipping_address.trim().is_empty() {
            missing.push("shipping_address");
        }
        if !missing.is_empty() {
            return Err(LedgerError::validation(format!(
                "Customer information incomplete: missing {}",
                missing.join(", ")
            )));
        }

        let email = self.email.trim();
        let well_formed = email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
        if !well_formed {
            return Err(LedgerError::validation(format!(
                "Customer email '{email}' is not valid"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_code: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

/// Completed sale. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub order_code: String,
    pub session_id: String,
    pub customer: CustomerInfo,
    pub items: Vec<OrderItem>,
    pub subtotal: BigDecimal,
    pub total: BigDecimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_code: String,
    pub session_id: String,
    pub customer: CustomerInfo,
    pub items: Vec<OrderItem>,
    pub subtotal: BigDecimal,
    pub total: BigDecimal,
}
