use thiserror::Error;

use crate::models::inventory::LocationType;

/// Errors surfaced by the inventory ledger, its cart and checkout.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error(
        "Insufficient stock for {product_code} at {location}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_code: String,
        location: LocationType,
        requested: i32,
        available: i32,
    },

    #[error("Out of stock: {product_code} requested {requested}, available {available}")]
    OutOfStock {
        product_code: String,
        requested: i32,
        available: i32,
    },

    #[error("Cart for session '{session_id}' is empty")]
    EmptyCart { session_id: String },

    #[error(
        "Capacity exceeded for batch {batch_id} at {location}: resulting quantity {resulting} exceeds capacity {capacity}"
    )]
    CapacityExceeded {
        batch_id: i64,
        location: LocationType,
        resulting: i32,
        capacity: i32,
    },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Storage failures inside a multi-step operation collapse into one
    /// `TransactionFailed`; domain errors keep their own shape.
    pub fn into_transaction_failure(self) -> Self {
        match self {
            Self::DatabaseError(msg) => Self::TransactionFailed(msg),
            other => other,
        }
    }
}

impl From<tiberius::error::Error> for LedgerError {
    fn from(error: tiberius::error::Error) -> Self {
        Self::DatabaseError(error.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_become_transaction_failures() {
        let err = LedgerError::DatabaseError("deadlock victim".to_string()).into_transaction_failure();
        assert!(matches!(err, LedgerError::TransactionFailed(ref m) if m == "deadlock victim"));

        let err = LedgerError::validation("bad").into_transaction_failure();
        assert!(matches!(err, LedgerError::ValidationError(_)));
    }

    #[test]
    fn insufficient_stock_message_names_the_numbers() {
        let err = LedgerError::InsufficientStock {
            product_code: "P1".to_string(),
            location: LocationType::Shelf,
            requested: 5,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for P1 at SHELF: requested 5, available 3"
        );
    }
}
