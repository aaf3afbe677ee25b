//! Route sequencing for a fixed set of orders
//!
//! Greedy nearest-neighbour over pickup points starting at the driver's
//! position. Deliveries follow in the same order as pickups. The result is
//! a heuristic, not an optimal tour, but it is fully deterministic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::BatchMetrics;
use crate::services::geo::{haversine_distance, travel_time_minutes};
use crate::types::{BatchOrder, Coordinates, Order};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptimizationResult {
    /// Order ids in pickup order
    pub pickup_sequence: Vec<Uuid>,
    /// Order ids in delivery order
    pub delivery_sequence: Vec<Uuid>,
    pub total_distance_km: f64,
    pub estimated_duration_minutes: i32,
    pub optimization_score: f64,
}

impl RouteOptimizationResult {
    pub fn metrics(&self) -> BatchMetrics {
        BatchMetrics {
            total_distance_km: self.total_distance_km,
            estimated_duration_minutes: self.estimated_duration_minutes,
            optimization_score: self.optimization_score,
        }
    }

    /// Membership rows with 1-based sequence numbers
    pub fn rows(&self, batch_id: Uuid) -> Vec<BatchOrder> {
        self.pickup_sequence
            .iter()
            .enumerate()
            .map(|(i, order_id)| {
                let delivery_position = self
                    .delivery_sequence
                    .iter()
                    .position(|id| id == order_id)
                    .unwrap_or(i);
                BatchOrder::pending(batch_id, *order_id, i as i32 + 1, delivery_position as i32 + 1)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSequencer {
    average_speed_kmh: f64,
    score_penalty_per_km: f64,
}

impl RouteSequencer {
    pub fn new(settings: &DispatchSettings) -> Self {
        Self {
            average_speed_kmh: settings.average_speed_kmh,
            score_penalty_per_km: settings.score_penalty_per_km,
        }
    }

    /// Order the pickups by nearest neighbour and measure the trip.
    ///
    /// Without an origin the first order seeds the walk. On equal distances
    /// the order that came first in `orders` wins.
    pub fn sequence(&self, orders: &[Order], origin: Option<Coordinates>) -> RouteOptimizationResult {
        let mut remaining: Vec<&Order> = orders.iter().collect();
        let mut visited: Vec<Order> = Vec::with_capacity(orders.len());

        let mut position = match origin {
            Some(origin) => origin,
            None if !remaining.is_empty() => {
                let first = remaining.remove(0);
                visited.push(first.clone());
                first.pickup
            }
            None => return self.measure(&[], &[], None),
        };

        while !remaining.is_empty() {
            let mut nearest = 0;
            let mut nearest_km = f64::INFINITY;
            for (i, order) in remaining.iter().enumerate() {
                let km = haversine_distance(&position, &order.pickup);
                if km < nearest_km {
                    nearest = i;
                    nearest_km = km;
                }
            }
            let next = remaining.remove(nearest);
            position = next.pickup;
            visited.push(next.clone());
        }

        self.measure(&visited, &visited, origin)
    }

    /// Measure a trip with fixed stop order: origin, every pickup, every delivery
    pub fn measure(
        &self,
        pickup_order: &[Order],
        delivery_order: &[Order],
        origin: Option<Coordinates>,
    ) -> RouteOptimizationResult {
        let stops = pickup_order
            .iter()
            .map(|o| o.pickup)
            .chain(delivery_order.iter().map(|o| o.delivery));

        let mut total_distance_km = 0.0;
        let mut previous = origin;
        for stop in stops {
            if let Some(prev) = previous {
                total_distance_km += haversine_distance(&prev, &stop);
            }
            previous = Some(stop);
        }

        let estimated_duration_minutes =
            travel_time_minutes(total_distance_km, self.average_speed_kmh).round() as i32;
        let optimization_score = (100.0 - self.score_penalty_per_km * total_distance_km).max(0.0);

        RouteOptimizationResult {
            pickup_sequence: pickup_order.iter().map(|o| o.id).collect(),
            delivery_sequence: delivery_order.iter().map(|o| o.id).collect(),
            total_distance_km,
            estimated_duration_minutes,
            optimization_score,
        }
    }
}

/// Member orders arranged by the rows' stored pickup and delivery sequences,
/// whatever order `orders` came in. `None` if a row's order is missing.
pub fn stop_order(rows: &[BatchOrder], orders: Vec<Order>) -> Option<(Vec<Order>, Vec<Order>)> {
    let by_id: HashMap<Uuid, Order> = orders.into_iter().map(|o| (o.id, o)).collect();
    let arrange = |key: fn(&BatchOrder) -> i32| -> Option<Vec<Order>> {
        let mut sorted: Vec<&BatchOrder> = rows.iter().collect();
        sorted.sort_by_key(|r| key(r));
        sorted.iter().map(|r| by_id.get(&r.order_id).cloned()).collect()
    };
    Some((arrange(|r| r.pickup_sequence)?, arrange(|r| r.delivery_sequence)?))
}
