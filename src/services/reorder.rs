//! Reorder advisor.
//!
//! The threshold is a pure function of current stock, an estimated capacity
//! and sales velocity over the window:
//!
//! | Tier   | Condition (either)           | Target | Floor |
//! |--------|------------------------------|--------|-------|
//! | Fast   | >= 10 sales or >= 50 units   | 40%    | 20    |
//! | Medium | >= 3 sales or >= 15 units    | 25%    | 10    |
//! | Slow   | >= 1 sale or >= 1 unit       | 15%    | 5     |
//! | New    | no sales                     | 20%    | 10    |
//!
//! `threshold = max(tier target, safety floor)`.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::commit_or_rollback;
use crate::constants;
use crate::database::store::LedgerStore;
use crate::error::{LedgerError, LedgerResult};
use crate::models::inventory::SalesVelocity;
use crate::models::reorder::{
    AlertSeverity, AlertStatus, NewAlert, ReorderAlert, ReorderAssessment, VelocityTier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderPolicy {
    pub safety_floor: i32,
    pub default_capacity: i32,
    pub velocity_window_days: i64,
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self {
            safety_floor: constants::REORDER_SAFETY_FLOOR,
            default_capacity: constants::DEFAULT_REORDER_CAPACITY,
            velocity_window_days: constants::SALES_VELOCITY_WINDOW_DAYS,
        }
    }
}

pub fn classify(velocity: &SalesVelocity) -> VelocityTier {
    let SalesVelocity {
        transactions,
        units_sold,
    } = *velocity;
    if transactions >= 10 || units_sold >= 50 {
        VelocityTier::Fast
    } else if transactions >= 3 || units_sold >= 15 {
        VelocityTier::Medium
    } else if transactions >= 1 || units_sold >= 1 {
        VelocityTier::Slow
    } else {
        VelocityTier::New
    }
}

/// Capacity fraction (percent) and minimum for each tier
fn tier_parameters(tier: VelocityTier) -> (i32, i32) {
    match tier {
        VelocityTier::Fast => (40, 20),
        VelocityTier::Medium => (25, 10),
        VelocityTier::Slow => (15, 5),
        VelocityTier::New => (20, 10),
    }
}

pub fn tier_target(tier: VelocityTier, capacity: i32) -> i32 {
    let (percent, floor) = tier_parameters(tier);
    let fraction = (i64::from(capacity.max(0)) * i64::from(percent) / 100) as i32;
    fraction.max(floor)
}

pub fn final_threshold(tier: VelocityTier, capacity: i32, safety_floor: i32) -> i32 {
    tier_target(tier, capacity).max(safety_floor)
}

pub fn assess(
    current_stock: i32,
    capacity: i32,
    velocity: &SalesVelocity,
    policy: &ReorderPolicy,
) -> ReorderAssessment {
    let tier = classify(velocity);
    let target = tier_target(tier, capacity);
    let threshold = target.max(policy.safety_floor);
    let needs_reorder = current_stock <= threshold;
    let severity = needs_reorder.then(|| {
        if current_stock < policy.safety_floor {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Consider
        }
    });

    ReorderAssessment {
        tier,
        current_stock,
        capacity,
        tier_target: target,
        threshold,
        needs_reorder,
        severity,
    }
}

#[derive(Clone)]
pub struct ReorderAdvisor {
    store: Arc<dyn LedgerStore>,
    policy: ReorderPolicy,
}

impl ReorderAdvisor {
    pub fn new(store: Arc<dyn LedgerStore>, policy: ReorderPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ReorderPolicy {
        &self.policy
    }

    /// Read-only assessment from current totals and recent sales
    pub async fn assess_product(&self, product_code: &str) -> LedgerResult<ReorderAssessment> {
        let product = self
            .store
            .find_product(product_code)
            .await?
            .ok_or_else(|| LedgerError::not_found("Product", product_code))?;

        let current_stock: i32 = self
            .store
            .quantity_by_location(product_code)
            .await?
            .values()
            .sum();
        let since = Utc::now() - Duration::days(self.policy.velocity_window_days);
        let velocity = self.store.sales_velocity(product_code, since).await?;
        let capacity = product
            .reorder_capacity
            .filter(|c| *c > 0)
            .unwrap_or(self.policy.default_capacity);

        Ok(assess(current_stock, capacity, &velocity, &self.policy))
    }

    /// Re-evaluates one product, superseding its open alerts. Returns the new alert if it is low.
    #[instrument(skip(self))]
    pub async fn evaluate_product(&self, product_code: &str) -> LedgerResult<Option<ReorderAlert>> {
        let assessment = self.assess_product(product_code).await?;

        let mut tx = self.store.begin().await?;
        let result: LedgerResult<Option<ReorderAlert>> = async {
            let superseded = tx.supersede_alerts(product_code).await?;
            if superseded > 0 {
                debug!("Superseded {} open alert(s) for {}", superseded, product_code);
            }
            match assessment.severity {
                Some(severity) => {
                    let alert = tx
                        .insert_alert(&NewAlert {
                            product_code: product_code.to_string(),
                            current_stock: assessment.current_stock,
                            threshold: assessment.threshold,
                            tier: assessment.tier,
                            severity,
                        })
                        .await?;
                    Ok(Some(alert))
                }
                None => Ok(None),
            }
        }
        .await;

        let alert = commit_or_rollback(tx, result)
            .await
            .map_err(LedgerError::into_transaction_failure)?;

        if let Some(alert) = &alert {
            info!(
                product = %alert.product_code,
                stock = alert.current_stock,
                threshold = alert.threshold,
                severity = alert.severity.code(),
                "📉 Reorder alert raised"
            );
        }
        Ok(alert)
    }

    /// One evaluation cycle across every active product
    pub async fn evaluate_all(&self) -> LedgerResult<Vec<ReorderAlert>> {
        let products = self.store.list_active_products().await?;
        let mut alerts = Vec::new();
        for product in &products {
            match self.evaluate_product(&product.product_code).await {
                Ok(Some(alert)) => alerts.push(alert),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "⚠️ Reorder evaluation failed for {}: {}",
                        product.product_code, e
                    );
                }
            }
        }
        info!(
            "🔁 Reorder evaluation complete: {} product(s), {} alert(s)",
            products.len(),
            alerts.len()
        );
        Ok(alerts)
    }

    /// Open alerts only
    pub async fn get_reorder_alerts(&self) -> LedgerResult<Vec<ReorderAlert>> {
        self.store.list_alerts(Some(AlertStatus::Open)).await
    }

    pub async fn resolve_alert(&self, alert_id: i64) -> LedgerResult<ReorderAlert> {
        let alert = self
            .store
            .find_alert(alert_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Reorder alert", alert_id.to_string()))?;
        if alert.status != AlertStatus::Open {
            return Err(LedgerError::validation(format!(
                "Reorder alert {} is already {}",
                alert_id,
                alert.status.code()
            )));
        }
        if !self.store.resolve_alert(alert_id).await? {
            return Err(LedgerError::validation(format!(
                "Reorder alert {alert_id} is no longer open"
            )));
        }
        info!("✅ Reorder alert {} resolved for {}", alert_id, alert.product_code);
        Ok(ReorderAlert {
            status: AlertStatus::Resolved,
            ..alert
        })
    }

    /// Periodic `evaluate_all`; runs until the task is dropped
    pub async fn evaluation_loop(self, every: std::time::Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("⏰ Reorder evaluation scheduled every {}s", every.as_secs());
        loop {
            ticker.tick().await;
            if let Err(e) = self.evaluate_all().await {
                warn!("⚠️ Scheduled reorder evaluation failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inventory::LocationType;
    use crate::test_support::{customer, Fixture};

    fn velocity(transactions: i32, units_sold: i32) -> SalesVelocity {
        SalesVelocity {
            transactions,
            units_sold,
        }
    }

    #[test]
    fn tiers_follow_either_condition() {
        assert_eq!(classify(&velocity(12, 0)), VelocityTier::Fast);
        assert_eq!(classify(&velocity(1, 50)), VelocityTier::Fast);
        assert_eq!(classify(&velocity(3, 3)), VelocityTier::Medium);
        assert_eq!(classify(&velocity(1, 15)), VelocityTier::Medium);
        assert_eq!(classify(&velocity(1, 1)), VelocityTier::Slow);
        assert_eq!(classify(&velocity(0, 0)), VelocityTier::New);
    }

    #[test]
    fn tier_targets_respect_tier_floors() {
        assert_eq!(tier_target(VelocityTier::Fast, 200), 80);
        assert_eq!(tier_target(VelocityTier::Fast, 10), 20);
        assert_eq!(tier_target(VelocityTier::Medium, 20), 10);
        assert_eq!(tier_target(VelocityTier::Slow, 100), 15);
        assert_eq!(tier_target(VelocityTier::New, 0), 10);
    }

    #[test]
    fn final_threshold_never_drops_below_safety_floor() {
        for tier in [
            VelocityTier::Fast,
            VelocityTier::Medium,
            VelocityTier::Slow,
            VelocityTier::New,
        ] {
            for capacity in [0, 1, 50, 100, 125, 200, 1_000, 10_000] {
                assert!(final_threshold(tier, capacity, 50) >= 50);
            }
        }
        assert_eq!(final_threshold(VelocityTier::Slow, 100, 50), 50);
        assert_eq!(final_threshold(VelocityTier::Fast, 1_000, 50), 400);
    }

    #[test]
    fn fast_mover_above_floor_gets_consider_alert() {
        let result = assess(55, 200, &velocity(12, 60), &ReorderPolicy::default());
        assert_eq!(result.tier, VelocityTier::Fast);
        assert_eq!(result.tier_target, 80);
        assert_eq!(result.threshold, 80);
        assert!(result.needs_reorder);
        assert_eq!(result.severity, Some(AlertSeverity::Consider));
    }

    #[test]
    fn stock_below_floor_is_critical_and_above_threshold_is_quiet() {
        let policy = ReorderPolicy::default();
        let low = assess(49, 100, &velocity(1, 1), &policy);
        assert_eq!(low.severity, Some(AlertSeverity::Critical));

        let boundary = assess(50, 100, &velocity(1, 1), &policy);
        assert!(boundary.needs_reorder);
        assert_eq!(boundary.severity, Some(AlertSeverity::Consider));

        let healthy = assess(51, 100, &velocity(1, 1), &policy);
        assert!(!healthy.needs_reorder);
        assert_eq!(healthy.severity, None);
    }

    #[tokio::test]
    async fn evaluation_supersedes_instead_of_duplicating() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 30).await;

        let first = fx.ledger.reorder.evaluate_product("P1").await.unwrap().unwrap();
        assert_eq!(first.severity, AlertSeverity::Critical);
        let second = fx.ledger.reorder.evaluate_product("P1").await.unwrap().unwrap();

        let open = fx.ledger.reorder.get_reorder_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_id, second.alert_id);

        let superseded = fx
            .store
            .list_alerts(Some(AlertStatus::Superseded))
            .await
            .unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].alert_id, first.alert_id);
    }

    #[tokio::test]
    async fn restocked_product_closes_its_open_alert() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 10).await;
        assert!(fx.ledger.reorder.evaluate_product("P1").await.unwrap().is_some());

        fx.receive("P1", LocationType::Warehouse, 500).await;
        assert!(fx.ledger.reorder.evaluate_product("P1").await.unwrap().is_none());
        assert!(fx.ledger.reorder.get_reorder_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn configured_capacity_and_sales_drive_the_threshold() {
        // P2 carries reorder_capacity = 200 in the fixture catalog
        let fx = Fixture::new().await;
        fx.receive("P2", LocationType::Online, 100).await;
        for _ in 0..12 {
            fx.ledger.carts.add_to_cart("s-fast", "P2", 5).await.unwrap();
            fx.ledger.checkout.checkout("s-fast", customer()).await.unwrap();
        }
        // 40 units left after 60 sold in 12 orders
        let assessment = fx.ledger.reorder.assess_product("P2").await.unwrap();
        assert_eq!(assessment.tier, VelocityTier::Fast);
        assert_eq!(assessment.capacity, 200);
        assert_eq!(assessment.threshold, 80);
        assert_eq!(assessment.current_stock, 40);
        assert_eq!(assessment.severity, Some(AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn resolving_twice_is_rejected() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Shelf, 5).await;
        let alert = fx.ledger.reorder.evaluate_product("P1").await.unwrap().unwrap();

        let resolved = fx.ledger.reorder.resolve_alert(alert.alert_id).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(matches!(
            fx.ledger.reorder.resolve_alert(alert.alert_id).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            fx.ledger.reorder.resolve_alert(9_999).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn evaluate_all_covers_active_products_only() {
        let fx = Fixture::new().await;
        fx.receive("P1", LocationType::Warehouse, 5).await;
        // P2 untouched (0 stock), P3 inactive
        let alerts = fx.ledger.reorder.evaluate_all().await.unwrap();
        let mut codes: Vec<_> = alerts.iter().map(|a| a.product_code.as_str()).collect();
        codes.sort();
        assert_eq!(codes, vec!["P1", "P2"]);
    }
}
