use chrono_tz::Tz;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::location_inventory::reduce_within;
use super::{commit_or_rollback, CartStore, MovementLog};
use crate::constants;
use crate::database::store::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::cart::Cart;
use crate::models::inventory::{BatchAllocation, LocationType, MovementKind, NewMovement};
use crate::models::order::{CustomerInfo, NewOrder, Order, OrderItem};
use crate::utils::document_stamp;

/// `ORD-<yyyymmddHHMMSS>-<4 digits>` in store time
fn next_order_code(timezone: Tz) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("ORD-{}-{:04}", document_stamp(timezone), suffix)
}

struct Placed {
    order: Order,
    allocations: Vec<(String, Vec<BatchAllocation>)>,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    carts: Arc<CartStore>,
    timeout: Duration,
    timezone: Tz,
    movements: MovementLog,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        carts: Arc<CartStore>,
        timeout: Duration,
        timezone: Tz,
        movements: MovementLog,
    ) -> Self {
        Self {
            store,
            carts,
            timeout,
            timezone,
            movements,
        }
    }

    /// Stock may have moved since items were added; re-check every line
    async fn revalidate(&self, cart: &Cart) -> LedgerResult<()> {
        for item in &cart.items {
            let product = self
                .store
                .find_product(&item.product_code)
                .await?
                .ok_or_else(|| LedgerError::not_found("Product", item.product_code.as_str()))?;
            if !product.is_active {
                return Err(LedgerError::validation(format!(
                    "Product {} is no longer available for sale",
                    item.product_code
                )));
            }
            let available = self
                .store
                .quantity_at(&item.product_code, LocationType::Online)
                .await?;
            if available < item.quantity {
                return Err(LedgerError::OutOfStock {
                    product_code: item.product_code.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn unique_order_code(&self, tx: &mut dyn LedgerTx) -> LedgerResult<String> {
        for attempt in 1..=constants::ORDER_CODE_MAX_ATTEMPTS {
            let code = next_order_code(self.timezone);
            if !tx.order_code_exists(&code).await? {
                return Ok(code);
            }
            warn!("⚠️ Order code {} already taken (attempt {})", code, attempt);
        }
        Err(LedgerError::TransactionFailed(format!(
            "could not allocate a unique order code after {} attempts",
            constants::ORDER_CODE_MAX_ATTEMPTS
        )))
    }

    async fn place_within(
        &self,
        tx: &mut dyn LedgerTx,
        session_id: &str,
        customer: &CustomerInfo,
        cart: &Cart,
    ) -> LedgerResult<Placed> {
        let order_code = self.unique_order_code(tx).await?;

        let items: Vec<OrderItem> = cart
            .items
            .iter()
            .map(|item| OrderItem {
                product_code: item.product_code.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
                line_total: item.line_total.clone(),
            })
            .collect();
        let order = tx
            .insert_order(&NewOrder {
                order_code,
                session_id: session_id.to_string(),
                customer: customer.clone(),
                items,
                subtotal: cart.subtotal.clone(),
                total: cart.total.clone(),
            })
            .await?;

        // Product order keeps lock acquisition consistent across checkouts
        let mut lines: Vec<_> = cart.items.iter().collect();
        lines.sort_by(|a, b| a.product_code.cmp(&b.product_code));

        let mut allocations = Vec::with_capacity(lines.len());
        for item in lines {
            let taken = reduce_within(tx, &item.product_code, LocationType::Online, item.quantity)
                .await
                .map_err(|e| match e {
                    LedgerError::InsufficientStock {
                        product_code,
                        requested,
                        available,
                        ..
                    } => LedgerError::OutOfStock {
                        product_code,
                        requested,
                        available,
                    },
                    other => other,
                })?;
            allocations.push((item.product_code.clone(), taken));
        }

        Ok(Placed { order, allocations })
    }

    /// Validate, decrement online stock and record the order atomically.
    ///
    /// Any failure leaves inventory and the cart as they were. The
    /// transactional part is bounded by the checkout timeout; on expiry the
    /// open transaction is dropped, which rolls it back.
    #[instrument(skip(self, customer))]
    pub async fn checkout(&self, session_id: &str, customer: CustomerInfo) -> LedgerResult<Order> {
        customer.validate()?;
        // Held until commit; dropping it on any early return hands the cart back
        let claim = self.carts.clone().claim(session_id)?;
        let cart = claim.cart();
        self.revalidate(cart).await?;

        let attempt = tokio::time::timeout(self.timeout, async {
            let mut tx = self.store.begin().await?;
            let result = self
                .place_within(tx.as_mut(), session_id, &customer, cart)
                .await;
            LedgerResult::Ok((tx, result))
        })
        .await;

        let (tx, result) = match attempt {
            Ok(started) => started.map_err(LedgerError::into_transaction_failure)?,
            Err(_) => {
                error!(
                    "⏱️ Checkout for session {} exceeded {}ms and was rolled back",
                    session_id,
                    self.timeout.as_millis()
                );
                return Err(LedgerError::TransactionFailed(format!(
                    "checkout timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let placed = commit_or_rollback(tx, result).await.map_err(|e| {
            warn!("❌ Checkout for session {} rolled back: {}", session_id, e);
            e.into_transaction_failure()
        })?;

        claim.complete();

        let order_code = placed.order.order_code.clone();
        let movements = placed
            .allocations
            .into_iter()
            .flat_map(|(product_code, taken)| {
                let order_code = order_code.clone();
                taken.into_iter().map(move |allocation| NewMovement {
                    product_code: product_code.clone(),
                    batch_id: Some(allocation.batch_id),
                    from_location: Some(LocationType::Online),
                    to_location: None,
                    quantity: allocation.quantity,
                    kind: MovementKind::Sale,
                    reason: format!("Order {order_code}"),
                })
            })
            .collect();
        self.movements.record_all(movements).await;

        info!(
            "🛒 Order {} placed: {} lines, total {}",
            placed.order.order_code,
            placed.order.items.len(),
            placed.order.total
        );
        Ok(placed.order)
    }

    pub async fn get_order(&self, order_code: &str) -> LedgerResult<Order> {
        self.store
            .find_order(order_code)
            .await?
            .ok_or_else(|| LedgerError::not_found("Order", order_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;
    use crate::test_support::{customer, Fixture};
    use bigdecimal::BigDecimal;

    async fn online(fx: &Fixture, code: &str) -> i32 {
        fx.ledger
            .inventory
            .get_quantity(code, LocationType::Online)
            .await
            .unwrap()
    }

    #[test]
    fn order_code_shape() {
        let code = next_order_code(chrono_tz::Tz::UTC);
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 14);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn exact_stock_checkout_empties_online_location() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 3).await;
        let cart = fx.ledger.carts.add_to_cart("s-1", "P1", 3).await.unwrap();
        let unit_price = cart.items[0].unit_price.clone();

        let order = fx.ledger.checkout.checkout("s-1", customer()).await.unwrap();
        assert_eq!(order.total, unit_price * BigDecimal::from(3));
        assert_eq!(order.items.len(), 1);
        assert_eq!(online(&fx, "P1").await, 0);
        assert!(fx.ledger.carts.get_cart("s-1").await.unwrap().is_empty());

        let fetched = fx.ledger.checkout.get_order(&order.order_code).await.unwrap();
        assert_eq!(fetched, order);
        let sales: Vec<_> = fx
            .ledger
            .movements
            .list("P1", None)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MovementKind::Sale)
            .collect();
        assert_eq!(sales.iter().map(|m| m.quantity).sum::<i32>(), 3);
    }

    #[tokio::test]
    async fn stock_drop_after_add_fails_checkout_and_keeps_cart() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 5).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 5).await.unwrap();
        fx.ledger
            .inventory
            .reduce_quantity("P1", LocationType::Online, 2)
            .await
            .unwrap();

        match fx.ledger.checkout.checkout("s-1", customer()).await {
            Err(LedgerError::OutOfStock {
                product_code,
                requested,
                available,
            }) => {
                assert_eq!(product_code, "P1");
                assert_eq!((requested, available), (5, 3));
            }
            other => panic!("expected out of stock, got {other:?}"),
        }
        assert_eq!(online(&fx, "P1").await, 3);
        assert_eq!(fx.ledger.carts.get_cart("s-1").await.unwrap().quantity_of("P1"), 5);
    }

    #[tokio::test]
    async fn empty_cart_and_bad_customer_are_rejected() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.ledger.checkout.checkout("s-1", customer()).await,
            Err(LedgerError::EmptyCart { .. })
        ));

        fx.receive("P1", LocationType::Online, 5).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 1).await.unwrap();
        let mut incomplete = customer();
        incomplete.email = "not-an-email".to_string();
        assert!(matches!(
            fx.ledger.checkout.checkout("s-1", incomplete).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert_eq!(online(&fx, "P1").await, 5);
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_everything() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 5).await;
        fx.receive("P2", LocationType::Online, 5).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 2).await.unwrap();
        fx.ledger.carts.add_to_cart("s-1", "P2", 1).await.unwrap();
        fx.store.fail_next_insert_order();

        assert!(matches!(
            fx.ledger.checkout.checkout("s-1", customer()).await,
            Err(LedgerError::TransactionFailed(_))
        ));
        assert_eq!(online(&fx, "P1").await, 5);
        assert_eq!(online(&fx, "P2").await, 5);
        assert_eq!(fx.ledger.carts.get_cart("s-1").await.unwrap().items.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_past_timeout_rolls_back() {
        let settings = LedgerSettings {
            checkout_timeout: Duration::from_millis(200),
            ..LedgerSettings::default()
        };
        let fx = Fixture::with_settings(settings).await;
        fx.receive("P1", LocationType::Online, 4).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 2).await.unwrap();
        fx.store.delay_next_insert_order(Duration::from_secs(5));

        assert!(matches!(
            fx.ledger.checkout.checkout("s-1", customer()).await,
            Err(LedgerError::TransactionFailed(_))
        ));
        assert_eq!(online(&fx, "P1").await, 4);
        assert_eq!(fx.ledger.carts.get_cart("s-1").await.unwrap().quantity_of("P1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_checkouts_of_one_session_place_one_order() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 10).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 3).await.unwrap();
        fx.store.delay_next_insert_order(Duration::from_millis(200));

        let first = fx.ledger.checkout.checkout("s-1", customer());
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fx.ledger.checkout.checkout("s-1", customer()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().items[0].quantity, 3);
        assert!(matches!(second, Err(LedgerError::ValidationError(_))));
        assert_eq!(online(&fx, "P1").await, 7);
        assert!(fx.ledger.carts.get_cart("s-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_checkout_can_be_retried() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Online, 5).await;
        fx.ledger.carts.add_to_cart("s-1", "P1", 2).await.unwrap();
        fx.store.fail_next_insert_order();

        assert!(fx.ledger.checkout.checkout("s-1", customer()).await.is_err());
        fx.ledger.carts.add_to_cart("s-1", "P1", 1).await.unwrap();
        let order = fx.ledger.checkout.checkout("s-1", customer()).await.unwrap();
        assert_eq!(order.items[0].quantity, 3);
        assert_eq!(online(&fx, "P1").await, 2);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.ledger.checkout.get_order("ORD-0-0000").await,
            Err(LedgerError::NotFound { entity: "Order", .. })
        ));
    }
}
