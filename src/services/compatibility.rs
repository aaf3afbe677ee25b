//! Order compatibility analysis
//!
//! Decides whether a set of orders may share one batch. Checks run in a
//! fixed order and stop at the first failure:
//!
//! 1. eligibility (ready and unassigned)
//! 2. geography (pickup spread and delivery spread)
//! 3. preparation-time window
//! 4. vendor mix
//!
//! The overall score is the product of the time and vendor sub-scores and
//! must reach the configured threshold.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::OrderStore;
use crate::error::DispatchError;
use crate::services::geo::haversine_distance;
use crate::services::retry::{with_retry, RetryPolicy};
use crate::types::Order;

/// Tolerance used when comparing the score to the threshold
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityResult {
    pub is_compatible: bool,
    pub reason: Option<String>,
    pub score: f64,
}

impl CompatibilityResult {
    fn compatible(score: f64) -> Self {
        Self {
            is_compatible: true,
            reason: None,
            score,
        }
    }

    fn incompatible(reason: impl Into<String>, score: f64) -> Self {
        Self {
            is_compatible: false,
            reason: Some(reason.into()),
            score,
        }
    }

    /// Score of a compatible set, `Incompatible` otherwise
    pub fn into_result(self) -> Result<f64, DispatchError> {
        if self.is_compatible {
            Ok(self.score)
        } else {
            Err(DispatchError::Incompatible {
                reason: self.reason.unwrap_or_default(),
                score: self.score,
            })
        }
    }
}

pub struct OrderCompatibilityAnalyzer {
    orders: Arc<dyn OrderStore>,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl OrderCompatibilityAnalyzer {
    pub fn new(orders: Arc<dyn OrderStore>, settings: DispatchSettings) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self { orders, settings, retry }
    }

    /// Fetch the orders and evaluate them. The fetched orders are returned
    /// alongside so callers do not read them twice.
    pub async fn analyze(
        &self,
        order_ids: &[Uuid],
        max_deviation_km: f64,
    ) -> Result<(CompatibilityResult, Vec<Order>), DispatchError> {
        if order_ids.is_empty() {
            return Ok((CompatibilityResult::incompatible("No orders to batch", 0.0), Vec::new()));
        }

        let orders = with_retry(&self.retry, "get_orders", || self.orders.get_orders(order_ids)).await?;
        let found: HashSet<Uuid> = orders.iter().map(|o| o.id).collect();
        if let Some(missing) = order_ids.iter().find(|id| !found.contains(id)) {
            return Ok((
                CompatibilityResult::incompatible(format!("Order {} not found", missing), 0.0),
                orders,
            ));
        }

        let result = self.evaluate(&orders, max_deviation_km);
        debug!(
            orders = orders.len(),
            compatible = result.is_compatible,
            score = result.score,
            "Compatibility analyzed"
        );
        Ok((result, orders))
    }

    /// Evaluate a candidate set without I/O
    pub fn evaluate(&self, orders: &[Order], max_deviation_km: f64) -> CompatibilityResult {
        if orders.is_empty() {
            return CompatibilityResult::incompatible("No orders to batch", 0.0);
        }
        for order in orders {
            if let Some(reason) = ineligibility(order) {
                return CompatibilityResult::incompatible(reason, 0.0);
            }
        }
        self.score(orders, max_deviation_km)
    }

    /// Evaluate an existing batch plus one candidate. Members are already
    /// claimed by the batch, so only the candidate has to be eligible.
    pub fn evaluate_extension(
        &self,
        members: &[Order],
        candidate: &Order,
        max_deviation_km: f64,
    ) -> CompatibilityResult {
        if let Some(reason) = ineligibility(candidate) {
            return CompatibilityResult::incompatible(reason, 0.0);
        }
        let mut union = members.to_vec();
        union.push(candidate.clone());
        self.score(&union, max_deviation_km)
    }

    fn score(&self, orders: &[Order], max_deviation_km: f64) -> CompatibilityResult {
        let s = &self.settings;

        // Geography: hard constraints, no sub-score
        for (i, a) in orders.iter().enumerate() {
            for b in &orders[i + 1..] {
                let pickup_km = haversine_distance(&a.pickup, &b.pickup);
                if pickup_km > max_deviation_km {
                    return CompatibilityResult::incompatible(
                        format!(
                            "Orders {} and {} are {:.1} km apart (max {:.1} km)",
                            a.id, b.id, pickup_km, max_deviation_km
                        ),
                        0.0,
                    );
                }
                let delivery_km = haversine_distance(&a.delivery, &b.delivery);
                if delivery_km > s.max_distance_between_orders_km {
                    return CompatibilityResult::incompatible(
                        format!(
                            "Delivery points of orders {} and {} are {:.1} km apart (max {:.1} km)",
                            a.id, b.id, delivery_km, s.max_distance_between_orders_km
                        ),
                        0.0,
                    );
                }
            }
        }

        // Preparation-time window
        let earliest = orders.iter().map(|o| o.estimated_delivery_time).min();
        let latest = orders.iter().map(|o| o.estimated_delivery_time).max();
        let span_minutes = match (earliest, latest) {
            (Some(e), Some(l)) => (l - e).num_seconds() as f64 / 60.0,
            _ => 0.0,
        };
        let window = s.prep_window_minutes as f64;
        if span_minutes > window {
            return CompatibilityResult::incompatible(
                format!(
                    "Estimated delivery times span {:.0} min (max {:.0} min)",
                    span_minutes, window
                ),
                0.0,
            );
        }
        let time_score = 1.0 - (span_minutes / window) * s.prep_time_penalty;

        // Vendor mix
        let vendors: HashSet<Uuid> = orders.iter().map(|o| o.vendor_id).collect();
        let vendor_score = if vendors.len() <= 1 { 1.0 } else { s.multi_vendor_score };

        let score = time_score * vendor_score;
        if score + SCORE_EPSILON < s.compatibility_threshold {
            return CompatibilityResult::incompatible(
                format!(
                    "Compatibility score {:.2} is below threshold {:.2} ({} vendors, {:.0} min span)",
                    score,
                    s.compatibility_threshold,
                    vendors.len(),
                    span_minutes
                ),
                score,
            );
        }
        CompatibilityResult::compatible(score)
    }
}

fn ineligibility(order: &Order) -> Option<String> {
    if order.status != crate::types::OrderStatus::Ready {
        return Some(format!(
            "Order {} is not ready for batching (status {})",
            order.id,
            order.status.as_str()
        ));
    }
    if let Some(driver_id) = order.assigned_driver_id {
        return Some(format!("Order {} is already assigned to driver {}", order.id, driver_id));
    }
    if let Some(batch_id) = order.batch_id {
        return Some(format!("Order {} already belongs to batch {}", order.id, batch_id));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::fixtures::order;
    use crate::db::memory::InMemoryStore;
    use crate::types::{Coordinates, OrderStatus};
    use chrono::Duration;

    fn analyzer() -> OrderCompatibilityAnalyzer {
        OrderCompatibilityAnalyzer::new(Arc::new(InMemoryStore::new()), DispatchSettings::default())
    }

    #[test]
    fn test_nearby_same_vendor_orders_are_compatible() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let o2 = order(v1, 3.105, 101.605, 5);

        let result = analyzer().evaluate(&[o1, o2], 5.0);

        assert!(result.is_compatible, "{:?}", result.reason);
        assert!(result.score >= 0.7);
        // 5 min span over a 30 min window
        assert!((result.score - (1.0 - 5.0 / 30.0 * 0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_orders_31_km_apart_are_incompatible() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let o3 = order(v1, 3.30, 101.80, 0);

        let result = analyzer().evaluate(&[o1, o3], 5.0);

        assert!(!result.is_compatible);
        let reason = result.reason.unwrap();
        assert!(reason.contains("km"));
        // Great-circle distance of the two points is ~31.4 km
        assert!(reason.contains("31.4 km apart"), "{}", reason);
    }

    #[test]
    fn test_distance_over_deviation_rejected_regardless_of_other_factors() {
        let v1 = Uuid::new_v4();
        // ~6 km apart, identical times and vendor
        let o1 = order(v1, 3.10, 101.60, 0);
        let o2 = order(v1, 3.154, 101.60, 0);

        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(!result.is_compatible);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_delivery_cap_applies_to_delivery_points() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let mut o2 = order(v1, 3.101, 101.601, 0);
        o2.delivery = Coordinates::new(3.25, 101.60);

        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(!result.is_compatible);
        assert!(result.reason.unwrap().starts_with("Delivery points"));
    }

    #[test]
    fn test_ineligible_order_short_circuits() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let mut o2 = order(v1, 3.30, 101.80, 0);
        o2.status = OrderStatus::Assigned;

        let result = analyzer().evaluate(&[o1, o2.clone()], 5.0);
        let reason = result.reason.unwrap();
        assert!(reason.contains(&o2.id.to_string()));
        assert!(reason.contains("assigned"));
    }

    #[test]
    fn test_prep_window_exceeded() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let mut o2 = order(v1, 3.101, 101.601, 0);
        o2.estimated_delivery_time = o1.estimated_delivery_time + Duration::minutes(45);

        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(!result.is_compatible);
        assert!(result.reason.unwrap().contains("45 min"));
    }

    #[test]
    fn test_full_window_single_vendor_stays_at_threshold() {
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let mut o2 = order(v1, 3.101, 101.601, 0);
        o2.estimated_delivery_time = o1.estimated_delivery_time + Duration::minutes(30);

        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(result.is_compatible);
        assert!((result.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_multi_vendor_with_tight_window_is_compatible() {
        let o1 = order(Uuid::new_v4(), 3.10, 101.60, 0);
        let o2 = order(Uuid::new_v4(), 3.101, 101.601, 0);

        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(result.is_compatible);
        assert!((result.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_multi_vendor_with_wide_window_falls_below_threshold() {
        let o1 = order(Uuid::new_v4(), 3.10, 101.60, 0);
        let mut o2 = order(Uuid::new_v4(), 3.101, 101.601, 0);
        o2.estimated_delivery_time = o1.estimated_delivery_time + Duration::minutes(20);

        // (1 - 20/30 * 0.3) * 0.8 = 0.64
        let result = analyzer().evaluate(&[o1, o2], 5.0);
        assert!(!result.is_compatible);
        assert!((result.score - 0.64).abs() < 1e-9);
        assert!(result.into_result().unwrap_err().to_string().contains("below threshold"));
    }

    #[test]
    fn test_single_vendor_sets_within_limits_always_reach_threshold() {
        let v1 = Uuid::new_v4();
        let analyzer = analyzer();
        for span in 0..=30 {
            for offset in [0.0, 0.01, 0.02, 0.03] {
                let o1 = order(v1, 3.10, 101.60, 0);
                let mut o2 = order(v1, 3.10 + offset, 101.60 + offset, 0);
                let mut o3 = order(v1, 3.10, 101.60 + offset, 0);
                o2.estimated_delivery_time = o1.estimated_delivery_time + Duration::minutes(span);
                o3.estimated_delivery_time = o1.estimated_delivery_time + Duration::minutes(span / 2);

                let result = analyzer.evaluate(&[o1, o2, o3], 5.0);
                assert!(result.is_compatible, "span {} offset {}: {:?}", span, offset, result.reason);
                assert!(result.score >= 0.7);
            }
        }
    }

    #[test]
    fn test_extension_checks_only_candidate_eligibility() {
        let v1 = Uuid::new_v4();
        let mut member = order(v1, 3.10, 101.60, 0);
        member.status = OrderStatus::Assigned;
        member.assigned_driver_id = Some(Uuid::new_v4());
        let candidate = order(v1, 3.101, 101.601, 2);

        let analyzer = analyzer();
        assert!(analyzer.evaluate_extension(&[member.clone()], &candidate, 5.0).is_compatible);

        let far = order(v1, 3.30, 101.80, 2);
        assert!(!analyzer.evaluate_extension(&[member], &far, 5.0).is_compatible);
    }

    #[tokio::test]
    async fn test_analyze_reports_missing_orders() {
        let store = InMemoryStore::new();
        let known = order(Uuid::new_v4(), 3.10, 101.60, 0);
        store.insert_order(known.clone());
        let analyzer = OrderCompatibilityAnalyzer::new(Arc::new(store), DispatchSettings::default());

        let missing = Uuid::new_v4();
        let (result, orders) = analyzer.analyze(&[known.id, missing], 5.0).await.unwrap();
        assert!(!result.is_compatible);
        assert!(result.reason.unwrap().contains(&missing.to_string()));
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_empty_set() {
        let (result, _) = analyzer().analyze(&[], 5.0).await.unwrap();
        assert!(!result.is_compatible);
    }

    #[tokio::test]
    async fn test_analyze_fetches_and_evaluates() {
        let store = InMemoryStore::new();
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let o2 = order(v1, 3.105, 101.605, 5);
        store.insert_order(o1.clone());
        store.insert_order(o2.clone());
        let analyzer = OrderCompatibilityAnalyzer::new(Arc::new(store), DispatchSettings::default());

        let (result, orders) = analyzer.analyze(&[o1.id, o2.id], 5.0).await.unwrap();
        assert!(result.is_compatible);
        assert_eq!(orders.iter().map(|o| o.id).collect::<Vec<_>>(), vec![o1.id, o2.id]);
    }
}
