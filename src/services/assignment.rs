//! Driver selection for a batch
//!
//! Candidates are online, active drivers with a known position inside the
//! search radius around the centroid of the delivery points. Each one gets a
//! weighted score (distance, workload, performance, batch-size fit) and the
//! highest score wins. Candidates are scored in ascending id order and only a
//! strictly better score replaces the leader, so ties go to the lowest id.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::DriverStore;
use crate::error::DispatchError;
use crate::services::geo::{centroid, haversine_distance};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::types::{Coordinates, Driver, Order};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAssignmentResult {
    pub driver_id: Uuid,
    pub score: f64,
    /// Driver position at selection time, the route origin
    pub location: Coordinates,
    pub metadata: serde_json::Value,
}

/// Weighted components of a driver score, each within 0..=1
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub distance_km: f64,
    pub distance: f64,
    pub workload: f64,
    pub performance: f64,
    pub batch_fit: f64,
    pub total: f64,
}

pub struct DriverAssignmentSelector {
    drivers: Arc<dyn DriverStore>,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl DriverAssignmentSelector {
    pub fn new(drivers: Arc<dyn DriverStore>, settings: DispatchSettings) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self { drivers, settings, retry }
    }

    /// Pick the best driver for `orders`, skipping ids in `exclude`
    pub async fn select(
        &self,
        orders: &[Order],
        search_radius_km: f64,
        exclude: &HashSet<Uuid>,
    ) -> Result<DriverAssignmentResult, DispatchError> {
        let deliveries: Vec<Coordinates> = orders.iter().map(|o| o.delivery).collect();
        let center = centroid(&deliveries)
            .ok_or_else(|| DispatchError::Validation("Cannot assign a driver to an empty batch".to_string()))?;

        let mut drivers = with_retry(&self.retry, "list_available_drivers", || {
            self.drivers.list_available_drivers()
        })
        .await?;
        drivers.sort_by_key(|d| d.id);

        let mut candidates = 0usize;
        let mut best: Option<(&Driver, Coordinates, ScoreBreakdown)> = None;
        for driver in &drivers {
            if exclude.contains(&driver.id) || !driver.is_available() || driver.holds_batch() {
                continue;
            }
            let Some(location) = driver.current_location else {
                continue;
            };
            if haversine_distance(&location, &center) > search_radius_km {
                continue;
            }
            candidates += 1;
            let breakdown = self.score_driver(driver, &center, search_radius_km, orders.len());
            debug!(driver_id = %driver.id, score = breakdown.total, "Scored driver");
            if best.map_or(true, |(_, _, b)| breakdown.total > b.total) {
                best = Some((driver, location, breakdown));
            }
        }

        let Some((driver, location, breakdown)) = best else {
            return Err(DispatchError::NoCandidate(format!(
                "No available driver within {:.1} km of the delivery area",
                search_radius_km
            )));
        };

        let degraded = breakdown.total <= 0.0;
        if degraded {
            warn!(
                driver_id = %driver.id,
                candidates,
                "Every candidate scored zero, assigning the first one anyway"
            );
        }
        info!(
            driver_id = %driver.id,
            score = breakdown.total,
            candidates,
            "Driver selected"
        );

        Ok(DriverAssignmentResult {
            driver_id: driver.id,
            score: breakdown.total,
            location,
            metadata: json!({
                "breakdown": breakdown,
                "candidates": candidates,
                "searchRadiusKm": search_radius_km,
                "degraded": degraded,
            }),
        })
    }

    pub fn score_driver(
        &self,
        driver: &Driver,
        center: &Coordinates,
        search_radius_km: f64,
        order_count: usize,
    ) -> ScoreBreakdown {
        let s = &self.settings;

        let distance_km = driver
            .current_location
            .map(|loc| haversine_distance(&loc, center))
            .unwrap_or(search_radius_km);
        let distance = 1.0 - (distance_km / search_radius_km).clamp(0.0, 1.0);

        let workload = if driver.holds_batch() {
            0.0
        } else {
            1.0 - (driver.workload_count as f64 / s.max_driver_workload as f64).clamp(0.0, 1.0)
        };

        let performance = match driver.performance {
            Some(p) if p.total_deliveries > 0 => {
                (p.rating / 5.0) * 0.5
                    + p.on_time_rate * 0.3
                    + (p.total_deliveries as f64 / 100.0).min(1.0) * 0.2
            }
            _ => s.default_performance_score,
        };

        let batch_fit = (order_count as f64 / s.max_orders_per_batch as f64).min(1.0);

        let w = &s.weights;
        let total = distance * w.distance + workload * w.workload + performance * w.performance + batch_fit * w.batch_fit;

        ScoreBreakdown {
            distance_km,
            distance,
            workload,
            performance,
            batch_fit,
            total,
        }
    }
}
