use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_code: String,
    pub name: String,
    pub quantity: i32,
    /// Final price captured when the item was first added
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

impl CartItem {
    pub fn new(product_code: String, name: String, quantity: i32, unit_price: BigDecimal) -> Self {
        let mut item = Self {
            product_code,
            name,
            quantity,
            unit_price,
            line_total: BigDecimal::zero(),
        };
        item.recompute();
        item
    }

    fn recompute(&mut self) {
        self.line_total = &self.unit_price * BigDecimal::from(self.quantity);
    }
}

/// Session-scoped selection. Totals are recomputed on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub session_id: String,
    pub items: Vec<CartItem>,
    pub subtotal: BigDecimal,
    pub total: BigDecimal,
}

impl Cart {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            items: Vec::new(),
            subtotal: BigDecimal::zero(),
            total: BigDecimal::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn quantity_of(&self, product_code: &str) -> i32 {
        self.items
            .iter()
            .find(|item| item.product_code == product_code)
            .map(|item| item.quantity)
            .unwrap_or(0)
    }

    /// Adds to an existing line or appends a new one
    pub fn add(&mut self, item: CartItem) {
        match self
            .items
            .iter_mut()
            .find(|existing| existing.product_code == item.product_code)
        {
            Some(existing) => {
                existing.quantity = existing.quantity.saturating_add(item.quantity);
                existing.recompute();
            }
            None => self.items.push(item),
        }
        self.recompute_totals();
    }

    /// Returns false if the product is not in the cart
    pub fn set_quantity(&mut self, product_code: &str, quantity: i32) -> bool {
        let updated = match self
            .items
            .iter_mut()
            .find(|item| item.product_code == product_code)
        {
            Some(item) => {
                item.quantity = quantity;
                item.recompute();
                true
            }
            None => false,
        };
        self.recompute_totals();
        updated
    }

    pub fn remove(&mut self, product_code: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.product_code != product_code);
        self.recompute_totals();
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.recompute_totals();
    }

    fn recompute_totals(&mut self) {
        self.subtotal = self
            .items
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + &item.line_total);
        // no cart-level discount
        self.total = self.subtotal.clone();
    }
}

/// Problem found on one cart line by validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartIssue {
    pub product_code: String,
    pub requested: i32,
    pub available: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartValidation {
    pub valid: bool,
    pub issues: Vec<CartIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn price(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn totals_follow_every_mutation() {
        let mut cart = Cart::new("s-1");
        cart.add(CartItem::new("P1".into(), "Widget".into(), 2, price("3.50")));
        cart.add(CartItem::new("P2".into(), "Gadget".into(), 1, price("10.00")));
        assert_eq!(cart.subtotal, price("17.00"));

        cart.add(CartItem::new("P1".into(), "Widget".into(), 1, price("3.50")));
        assert_eq!(cart.quantity_of("P1"), 3);
        assert_eq!(cart.items[0].line_total, price("10.50"));
        assert_eq!(cart.total, price("20.50"));

        assert!(cart.set_quantity("P2", 3));
        assert_eq!(cart.total, price("40.50"));

        assert!(cart.remove("P1"));
        assert!(!cart.remove("P1"));
        assert_eq!(cart.subtotal, price("30.00"));

        cart.clear();
        assert!(cart.is_empty());
        assert_eq!(cart.total, BigDecimal::zero());
    }

    #[test]
    fn merged_line_quantity_saturates() {
        let mut cart = Cart::new("s-1");
        cart.add(CartItem::new("P1".into(), "Widget".into(), 5, price("1.00")));
        cart.add(CartItem::new("P1".into(), "Widget".into(), i32::MAX, price("1.00")));
        assert_eq!(cart.quantity_of("P1"), i32::MAX);
        assert_eq!(cart.items.len(), 1);
    }
}
