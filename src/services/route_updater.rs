//! Adding orders to and removing orders from live batches

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::{BatchStore, DriverStore, OrderStore};
use crate::error::DispatchError;
use crate::services::compatibility::OrderCompatibilityAnalyzer;
use crate::services::events::{emit, EventPublisher};
use crate::services::lifecycle::BatchLifecycleManager;
use crate::services::locks::{KeyedLocks, LockKey};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::sequencer::{stop_order, RouteOptimizationResult, RouteSequencer};
use crate::types::{
    Batch, BatchDetail, BatchEvent, BatchEventType, BatchOrder, BatchStatus, Coordinates, LegStatus, Order,
    OrderStatus,
};

pub struct DynamicRouteUpdater {
    batches: Arc<dyn BatchStore>,
    orders: Arc<dyn OrderStore>,
    drivers: Arc<dyn DriverStore>,
    analyzer: Arc<OrderCompatibilityAnalyzer>,
    lifecycle: Arc<BatchLifecycleManager>,
    sequencer: RouteSequencer,
    events: Arc<dyn EventPublisher>,
    locks: KeyedLocks,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl DynamicRouteUpdater {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        orders: Arc<dyn OrderStore>,
        drivers: Arc<dyn DriverStore>,
        analyzer: Arc<OrderCompatibilityAnalyzer>,
        lifecycle: Arc<BatchLifecycleManager>,
        events: Arc<dyn EventPublisher>,
        locks: KeyedLocks,
        settings: DispatchSettings,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            batches,
            orders,
            drivers,
            analyzer,
            lifecycle,
            sequencer: RouteSequencer::new(&settings),
            events,
            locks,
            settings,
            retry,
        }
    }

    /// Append a ready order to the end of the batch's route
    pub async fn add_order(&self, batch_id: Uuid, order_id: Uuid) -> Result<BatchDetail, DispatchError> {
        let _held = self
            .locks
            .acquire([LockKey::Batch(batch_id), LockKey::Order(order_id)])
            .await;

        let mut attempts = 0u32;
        loop {
            let batch = self.load_mutable(batch_id).await?;
            let rows = self.load_rows(batch_id).await?;
            if rows.len() >= batch.max_orders.max(0) as usize {
                return Err(DispatchError::Validation(format!(
                    "Batch {} already holds {} orders (max {})",
                    batch.batch_number,
                    rows.len(),
                    batch.max_orders
                )));
            }
            if rows.iter().any(|r| r.order_id == order_id) {
                return Err(DispatchError::Validation(format!(
                    "Order {} is already part of batch {}",
                    order_id, batch.batch_number
                )));
            }

            let members = self.fetch_in_pickup_order(&rows).await?;
            let candidate = self
                .fetch_orders(&[order_id])
                .await?
                .pop()
                .ok_or_else(|| DispatchError::Validation(format!("Order {} not found", order_id)))?;
            self.analyzer
                .evaluate_extension(&members, &candidate, batch.max_deviation_km)
                .into_result()?;

            let next_pickup = rows.iter().map(|r| r.pickup_sequence).max().unwrap_or(0) + 1;
            let next_delivery = rows.iter().map(|r| r.delivery_sequence).max().unwrap_or(0) + 1;
            let row = BatchOrder::pending(batch_id, order_id, next_pickup, next_delivery);
            let order_status = match batch.status {
                BatchStatus::Planned => OrderStatus::Ready,
                _ => OrderStatus::Assigned,
            };

            let attached = with_retry(&self.retry, "attach_order", || {
                self.batches.attach_order(&row, batch.driver_id, order_status)
            })
            .await?;
            if !attached {
                attempts += 1;
                if attempts > self.settings.conflict_max_retries {
                    return Err(DispatchError::Conflict(format!(
                        "Could not attach order {} to batch {}",
                        order_id, batch.batch_number
                    )));
                }
                debug!(batch_id = %batch_id, order_id = %order_id, attempts, "Attach lost a race, re-reading");
                continue;
            }

            let mut route_orders = members;
            route_orders.push(candidate);
            let mut delivery_rows = rows;
            delivery_rows.push(row);
            self.refresh_metrics(&batch, &route_orders, &delivery_rows).await?;

            info!(batch_id = %batch_id, order_id = %order_id, "Order added to batch");
            emit(
                self.events.as_ref(),
                BatchEvent::new(BatchEventType::OrderAdded, batch_id, vec![order_id])
                    .with_driver(batch.driver_id)
                    .with_details(json!({ "pickupSequence": next_pickup })),
            )
            .await;

            return self.detail(batch_id).await;
        }
    }

    /// Take an order out of the batch and close the gap in the sequences.
    /// A started batch left with only delivered orders is completed.
    pub async fn remove_order(&self, batch_id: Uuid, order_id: Uuid) -> Result<BatchDetail, DispatchError> {
        let _held = self
            .locks
            .acquire([LockKey::Batch(batch_id), LockKey::Order(order_id)])
            .await;

        let mut attempts = 0u32;
        loop {
            let batch = self.load_mutable(batch_id).await?;
            let rows = self.load_rows(batch_id).await?;
            if !rows.iter().any(|r| r.order_id == order_id) {
                return Err(DispatchError::Validation(format!(
                    "Order {} is not part of batch {}",
                    order_id, batch.batch_number
                )));
            }
            if rows.len() == 1 {
                return Err(DispatchError::Validation(format!(
                    "Order {} is the last one in batch {}; cancel the batch instead",
                    order_id, batch.batch_number
                )));
            }
            let delivered = self
                .fetch_orders(&[order_id])
                .await?
                .first()
                .is_some_and(|o| o.status == OrderStatus::Delivered);
            if delivered {
                return Err(DispatchError::State(format!(
                    "Order {} was already delivered and cannot be removed",
                    order_id
                )));
            }

            let remaining: Vec<BatchOrder> = rows.iter().filter(|r| r.order_id != order_id).cloned().collect();
            let resequenced = resequence(&remaining);

            let detached = with_retry(&self.retry, "detach_order", || {
                self.batches.detach_order(batch_id, order_id, &resequenced)
            })
            .await?;
            if !detached {
                attempts += 1;
                if attempts > self.settings.conflict_max_retries {
                    return Err(DispatchError::Conflict(format!(
                        "Could not detach order {} from batch {}",
                        order_id, batch.batch_number
                    )));
                }
                debug!(batch_id = %batch_id, order_id = %order_id, attempts, "Detach lost a race, re-reading");
                continue;
            }

            let route_orders = self.fetch_in_pickup_order(&resequenced).await?;
            self.refresh_metrics(&batch, &route_orders, &resequenced).await?;

            info!(batch_id = %batch_id, order_id = %order_id, "Order removed from batch");
            emit(
                self.events.as_ref(),
                BatchEvent::new(BatchEventType::OrderRemoved, batch_id, vec![order_id]).with_driver(batch.driver_id),
            )
            .await;

            let all_delivered = resequenced.iter().all(|r| r.delivery_status == LegStatus::Completed);
            if batch.status != BatchStatus::Planned && all_delivered {
                info!(batch_id = %batch_id, "Only delivered orders remain, completing batch");
                self.lifecycle.complete_held(batch_id).await?;
            }

            return self.detail(batch_id).await;
        }
    }

    /// Re-measure the route in its stored stop order and save the metrics
    async fn refresh_metrics(
        &self,
        batch: &Batch,
        pickup_order: &[Order],
        rows: &[BatchOrder],
    ) -> Result<RouteOptimizationResult, DispatchError> {
        let mut delivery_order = pickup_order.to_vec();
        delivery_order.sort_by_key(|o| {
            rows.iter()
                .find(|r| r.order_id == o.id)
                .map_or(i32::MAX, |r| r.delivery_sequence)
        });
        let origin = self.driver_location(batch.driver_id).await?;
        let route = self.sequencer.measure(pickup_order, &delivery_order, origin);

        let metrics = route.metrics();
        with_retry(&self.retry, "update_metrics", || {
            self.batches.update_metrics(batch.id, &metrics)
        })
        .await?;
        debug!(
            batch_id = %batch.id,
            distance_km = route.total_distance_km,
            score = route.optimization_score,
            "Batch metrics refreshed"
        );
        Ok(route)
    }

    async fn driver_location(&self, driver_id: Uuid) -> Result<Option<Coordinates>, DispatchError> {
        let driver = with_retry(&self.retry, "get_driver", || self.drivers.get_driver(driver_id)).await?;
        Ok(driver.and_then(|d| d.current_location))
    }

    async fn load_mutable(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        let batch = with_retry(&self.retry, "get_batch", || self.batches.get_batch(batch_id))
            .await?
            .ok_or_else(|| DispatchError::Validation(format!("Batch {} not found", batch_id)))?;
        if batch.status.is_terminal() {
            return Err(DispatchError::State(format!(
                "Batch {} is {} and can no longer change",
                batch.batch_number,
                batch.status.as_str()
            )));
        }
        Ok(batch)
    }

    async fn load_rows(&self, batch_id: Uuid) -> Result<Vec<BatchOrder>, DispatchError> {
        with_retry(&self.retry, "get_batch_orders", || self.batches.get_batch_orders(batch_id)).await
    }

    async fn fetch_orders(&self, ids: &[Uuid]) -> Result<Vec<Order>, DispatchError> {
        with_retry(&self.retry, "get_orders", || self.orders.get_orders(ids)).await
    }

    /// Member orders sorted by their rows' pickup sequence
    async fn fetch_in_pickup_order(&self, rows: &[BatchOrder]) -> Result<Vec<Order>, DispatchError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.order_id).collect();
        let orders = self.fetch_orders(&ids).await?;
        stop_order(rows, orders)
            .map(|(pickups, _)| pickups)
            .ok_or_else(|| DispatchError::Conflict("Batch members changed while reading".to_string()))
    }

    async fn detail(&self, batch_id: Uuid) -> Result<BatchDetail, DispatchError> {
        let batch = with_retry(&self.retry, "get_batch", || self.batches.get_batch(batch_id))
            .await?
            .ok_or_else(|| DispatchError::Validation(format!("Batch {} not found", batch_id)))?;
        let orders = self.load_rows(batch_id).await?;
        Ok(BatchDetail { batch, orders })
    }
}

/// Contiguous 1..N sequences keeping the relative pickup and delivery order
fn resequence(rows: &[BatchOrder]) -> Vec<BatchOrder> {
    let mut by_pickup = rows.to_vec();
    by_pickup.sort_by_key(|r| r.pickup_sequence);

    let by_delivery: Vec<Uuid> = {
        let mut sorted = rows.to_vec();
        sorted.sort_by_key(|r| r.delivery_sequence);
        sorted.into_iter().map(|r| r.order_id).collect()
    };

    for (i, row) in by_pickup.iter_mut().enumerate() {
        row.pickup_sequence = i as i32 + 1;
        let position = by_delivery.iter().position(|id| *id == row.order_id).unwrap_or(i);
        row.delivery_sequence = position as i32 + 1;
    }
    by_pickup
}
