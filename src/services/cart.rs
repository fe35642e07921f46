use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::database::store::LedgerStore;
use crate::error::{LedgerError, LedgerResult};
use crate::models::cart::{Cart, CartIssue, CartItem, CartValidation};
use crate::models::inventory::{LocationType, Product};

struct CartEntry {
    cart: Cart,
    touched_at: Instant,
    /// Set while a checkout owns the cart; mutations are refused until it settles
    checking_out: bool,
}

impl CartEntry {
    fn new(session_id: &str) -> Self {
        Self {
            cart: Cart::new(session_id),
            touched_at: Instant::now(),
            checking_out: false,
        }
    }
}

fn checkout_in_progress(session_id: &str) -> LedgerError {
    LedgerError::validation(format!(
        "Checkout already in progress for session '{session_id}'"
    ))
}

/// Session carts shared across requests, expired after `ttl` of inactivity.
///
/// Closures passed to `update` run under a shard lock and must not await.
pub struct CartStore {
    carts: DashMap<String, CartEntry>,
    ttl: Duration,
}

impl CartStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            carts: DashMap::new(),
            ttl,
        }
    }

    /// Current cart, or an empty one for a session that has none
    pub fn snapshot(&self, session_id: &str) -> Cart {
        self.carts
            .get(session_id)
            .map(|entry| entry.cart.clone())
            .unwrap_or_else(|| Cart::new(session_id))
    }

    /// Mutates the session's cart, creating it on first use. Refused while a
    /// checkout holds the cart.
    pub fn update<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Cart) -> LedgerResult<R>,
    ) -> LedgerResult<R> {
        let mut entry = self
            .carts
            .entry(session_id.to_string())
            .or_insert_with(|| CartEntry::new(session_id));
        if entry.checking_out {
            return Err(checkout_in_progress(session_id));
        }
        entry.touched_at = Instant::now();
        f(&mut entry.cart)
    }

    pub fn clear(&self, session_id: &str) -> LedgerResult<()> {
        let removed = self
            .carts
            .remove_if(session_id, |_, entry| !entry.checking_out);
        if removed.is_none() && self.carts.contains_key(session_id) {
            return Err(checkout_in_progress(session_id));
        }
        Ok(())
    }

    /// Hands the cart to one checkout. A second claim on the same session
    /// fails until the first one completes or is dropped.
    pub fn claim(self: Arc<Self>, session_id: &str) -> LedgerResult<CartClaim> {
        let cart = {
            let mut entry = match self.carts.get_mut(session_id) {
                Some(entry) => entry,
                None => {
                    return Err(LedgerError::EmptyCart {
                        session_id: session_id.to_string(),
                    })
                }
            };
            if entry.checking_out {
                return Err(checkout_in_progress(session_id));
            }
            if entry.cart.is_empty() {
                return Err(LedgerError::EmptyCart {
                    session_id: session_id.to_string(),
                });
            }
            entry.checking_out = true;
            entry.touched_at = Instant::now();
            entry.cart.clone()
        };

        Ok(CartClaim {
            store: self,
            session_id: session_id.to_string(),
            cart,
            completed: false,
        })
    }

    fn release(&self, session_id: &str) {
        if let Some(mut entry) = self.carts.get_mut(session_id) {
            entry.checking_out = false;
            entry.touched_at = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }

    /// Drops carts idle for longer than the TTL, returning how many went.
    /// Carts under checkout are kept.
    pub fn sweep_expired(&self) -> usize {
        let before = self.carts.len();
        let ttl = self.ttl;
        self.carts
            .retain(|_, entry| entry.checking_out || entry.touched_at.elapsed() <= ttl);
        before.saturating_sub(self.carts.len())
    }

    /// Background sweep; runs until the task is dropped
    pub async fn sweep_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "🧹 Cart sweeper started (ttl {}s, every {}s)",
            self.ttl.as_secs(),
            every.as_secs()
        );
        loop {
            ticker.tick().await;
            let removed = self.sweep_expired();
            if removed > 0 {
                info!("🧹 Expired {} idle carts ({} active)", removed, self.len());
            }
        }
    }
}

/// Exclusive hold on a session's cart for the length of one checkout.
///
/// Dropping the claim without `complete` hands the cart back unchanged, so
/// every failure path (including a timed-out or cancelled checkout) restores it.
pub struct CartClaim {
    store: Arc<CartStore>,
    session_id: String,
    cart: Cart,
    completed: bool,
}

impl CartClaim {
    pub fn cart(&self) -> &Cart {
        &self.cart
    }

    /// The order is committed; the cart goes with it
    pub fn complete(mut self) {
        self.store.carts.remove(&self.session_id);
        self.completed = true;
    }
}

impl Drop for CartClaim {
    fn drop(&mut self) {
        if !self.completed {
            debug!(session_id = %self.session_id, "Cart handed back after unfinished checkout");
            self.store.release(&self.session_id);
        }
    }
}

#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn LedgerStore>,
    carts: Arc<CartStore>,
}

impl CartService {
    pub fn new(store: Arc<dyn LedgerStore>, carts: Arc<CartStore>) -> Self {
        Self { store, carts }
    }

    pub fn cart_store(&self) -> Arc<CartStore> {
        self.carts.clone()
    }

    fn check_session(session_id: &str) -> LedgerResult<()> {
        if session_id.trim().is_empty() {
            return Err(LedgerError::validation("Session id must not be empty"));
        }
        Ok(())
    }

    async fn sellable_product(&self, product_code: &str) -> LedgerResult<Product> {
        let product = self
            .store
            .find_product(product_code)
            .await?
            .ok_or_else(|| LedgerError::not_found("Product", product_code))?;
        if !product.is_active {
            return Err(LedgerError::validation(format!(
                "Product {product_code} is not available for sale"
            )));
        }
        Ok(product)
    }

    async fn online_available(&self, product_code: &str) -> LedgerResult<i32> {
        self.store.quantity_at(product_code, LocationType::Online).await
    }

    /// Fails with `OutOfStock` when the cart's cumulative quantity would
    /// exceed what the online location holds
    #[instrument(skip(self))]
    pub async fn add_to_cart(&self, session_id: &str, product_code: &str, quantity: i32) -> LedgerResult<Cart> {
        Self::check_session(session_id)?;
        if quantity <= 0 {
            return Err(LedgerError::validation(format!(
                "Quantity must be greater than 0, got {quantity}"
            )));
        }
        let product = self.sellable_product(product_code).await?;
        let available = self.online_available(product_code).await?;

        let cart = self.carts.update(session_id, |cart| {
            let requested = cart
                .quantity_of(product_code)
                .checked_add(quantity)
                .unwrap_or(i32::MAX);
            if requested > available {
                return Err(LedgerError::OutOfStock {
                    product_code: product_code.to_string(),
                    requested,
                    available,
                });
            }
            cart.add(CartItem::new(
                product.product_code.clone(),
                product.name.clone(),
                quantity,
                product.final_price(),
            ));
            Ok(cart.clone())
        })?;

        debug!(session_id, product_code, quantity, "Cart line added");
        Ok(cart)
    }

    /// Sets a line's quantity; 0 removes the line
    #[instrument(skip(self))]
    pub async fn update_cart_item(
        &self,
        session_id: &str,
        product_code: &str,
        quantity: i32,
    ) -> LedgerResult<Cart> {
        Self::check_session(session_id)?;
        if quantity < 0 {
            return Err(LedgerError::validation(format!(
                "Quantity must not be negative, got {quantity}"
            )));
        }
        if quantity == 0 {
            return self.remove_from_cart(session_id, product_code).await;
        }
        if self.carts.snapshot(session_id).quantity_of(product_code) == 0 {
            return Err(LedgerError::not_found("Cart item", product_code));
        }
        let available = self.online_available(product_code).await?;
        if quantity > available {
            return Err(LedgerError::OutOfStock {
                product_code: product_code.to_string(),
                requested: quantity,
                available,
            });
        }

        self.carts.update(session_id, |cart| {
            if cart.set_quantity(product_code, quantity) {
                Ok(cart.clone())
            } else {
                Err(LedgerError::not_found("Cart item", product_code))
            }
        })
    }

    pub async fn remove_from_cart(&self, session_id: &str, product_code: &str) -> LedgerResult<Cart> {
        Self::check_session(session_id)?;
        self.carts.update(session_id, |cart| {
            if cart.remove(product_code) {
                Ok(cart.clone())
            } else {
                Err(LedgerError::not_found("Cart item", product_code))
            }
        })
    }

    pub async fn clear_cart(&self, session_id: &str) -> LedgerResult<Cart> {
        Self::check_session(session_id)?;
        self.carts.clear(session_id)?;
        Ok(Cart::new(session_id))
    }

    pub async fn get_cart(&self, session_id: &str) -> LedgerResult<Cart> {
        Self::check_session(session_id)?;
        Ok(self.carts.snapshot(session_id))
    }

    /// Re-checks every line against the catalog and online stock without
    /// touching the cart. An empty cart is never valid.
    pub async fn validate_cart(&self, session_id: &str) -> LedgerResult<CartValidation> {
        Self::check_session(session_id)?;
        let cart = self.carts.snapshot(session_id);
        let mut issues = Vec::new();

        for item in &cart.items {
            let product = self.store.find_product(&item.product_code).await?;
            let message = match product {
                None => Some("Product no longer exists".to_string()),
                Some(p) if !p.is_active => Some("Product is no longer available".to_string()),
                Some(_) => None,
            };
            if let Some(message) = message {
                issues.push(CartIssue {
                    product_code: item.product_code.clone(),
                    requested: item.quantity,
                    available: 0,
                    message,
                });
                continue;
            }

            let available = self.online_available(&item.product_code).await?;
            if available < item.quantity {
                issues.push(CartIssue {
                    product_code: item.product_code.clone(),
                    requested: item.quantity,
                    available,
                    message: format!("Only {available} available"),
                });
            }
        }

        Ok(CartValidation {
            valid: !cart.is_empty() && issues.is_empty(),
            issues,
        })
    }
}
