//! Batch lifecycle
//!
//! ```text
//! planned --start--> active --pause--> paused --resume--> active
//! planned | active | paused --cancel--> cancelled
//! active | paused --complete--> completed   (every delivery completed)
//! ```
//!
//! Every transition is a compare-and-swap on the status read just before
//! it. A lost swap re-reads the batch and tries again a bounded number of
//! times before surfacing `Conflict`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::{BatchStore, BatchTransition, LegUpdate, OrderEffect, OrderStore};
use crate::error::DispatchError;
use crate::services::events::{emit, EventPublisher};
use crate::services::locks::{KeyedLocks, LockKey};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::sequencer::RouteOptimizationResult;
use crate::types::{
    batch_number, Batch, BatchDetail, BatchEvent, BatchEventType, BatchOrder, BatchStatus, Leg, LegStatus,
    OrderStatus,
};

/// Result of a pickup or delivery update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegUpdateOutcome {
    pub order: BatchOrder,
    /// Batch after the update, `completed` when this was the last delivery
    pub batch: Batch,
}

pub struct BatchLifecycleManager {
    batches: Arc<dyn BatchStore>,
    orders: Arc<dyn OrderStore>,
    events: Arc<dyn EventPublisher>,
    locks: KeyedLocks,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl BatchLifecycleManager {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        orders: Arc<dyn OrderStore>,
        events: Arc<dyn EventPublisher>,
        locks: KeyedLocks,
        settings: DispatchSettings,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            batches,
            orders,
            events,
            locks,
            settings,
            retry,
        }
    }

    /// Persist a planned batch for `driver_id` with the sequenced route.
    ///
    /// The store claims the driver and every order in the same unit; a taken
    /// claim surfaces as `Conflict` and nothing is written.
    pub async fn create_batch(
        &self,
        driver_id: Uuid,
        route: &RouteOptimizationResult,
        max_deviation_km: f64,
        metadata: serde_json::Value,
    ) -> Result<BatchDetail, DispatchError> {
        let count = route.pickup_sequence.len();
        if count == 0 || count > self.settings.max_orders_per_batch {
            return Err(DispatchError::Validation(format!(
                "A batch holds 1 to {} orders, got {}",
                self.settings.max_orders_per_batch, count
            )));
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let batch = Batch {
            id,
            driver_id,
            batch_number: batch_number(id, created_at),
            status: BatchStatus::Planned,
            total_distance_km: route.total_distance_km,
            estimated_duration_minutes: route.estimated_duration_minutes,
            optimization_score: route.optimization_score,
            max_orders: self.settings.max_orders_per_batch as i32,
            max_deviation_km,
            created_at,
            actual_start_time: None,
            actual_completion_time: None,
            metadata,
        };
        let rows = route.rows(id);

        with_retry(&self.retry, "create_batch", || self.batches.create_batch(&batch, &rows)).await?;

        info!(
            batch_id = %id,
            batch_number = %batch.batch_number,
            driver_id = %driver_id,
            orders = count,
            distance_km = route.total_distance_km,
            "Batch created"
        );
        emit(
            self.events.as_ref(),
            BatchEvent::new(BatchEventType::BatchCreated, id, route.pickup_sequence.clone())
                .with_driver(driver_id)
                .with_details(json!({
                    "batchNumber": batch.batch_number,
                    "totalDistanceKm": batch.total_distance_km,
                    "estimatedDurationMinutes": batch.estimated_duration_minutes,
                })),
        )
        .await;

        Ok(BatchDetail { batch, orders: rows })
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> Result<BatchDetail, DispatchError> {
        let batch = self.load(batch_id).await?;
        let orders = self.load_rows(batch_id).await?;
        Ok(BatchDetail { batch, orders })
    }

    pub async fn start_batch(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        self.transition(batch_id, BatchStatus::Active, None).await
    }

    pub async fn pause_batch(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        self.transition(batch_id, BatchStatus::Paused, None).await
    }

    pub async fn resume_batch(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        self.transition(batch_id, BatchStatus::Active, None).await
    }

    /// Cancel the batch, returning undelivered orders to the pool
    pub async fn cancel_batch(&self, batch_id: Uuid, reason: &str) -> Result<Batch, DispatchError> {
        self.transition(batch_id, BatchStatus::Cancelled, Some(reason)).await
    }

    /// Complete the batch; fails unless every delivery is completed
    pub async fn complete_batch(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        self.transition(batch_id, BatchStatus::Completed, None).await
    }

    /// Complete a batch whose lock the caller already holds
    pub async fn complete_held(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        self.transition_locked(batch_id, BatchStatus::Completed, None).await
    }

    pub async fn update_pickup(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        status: LegStatus,
    ) -> Result<LegUpdateOutcome, DispatchError> {
        self.update_leg(batch_id, order_id, Leg::Pickup, status).await
    }

    /// Record a delivery outcome. The last completed delivery completes the batch.
    pub async fn update_delivery(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        status: LegStatus,
    ) -> Result<LegUpdateOutcome, DispatchError> {
        self.update_leg(batch_id, order_id, Leg::Delivery, status).await
    }

    async fn update_leg(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        leg: Leg,
        status: LegStatus,
    ) -> Result<LegUpdateOutcome, DispatchError> {
        if status == LegStatus::Pending {
            return Err(DispatchError::Validation("A leg can only move away from pending".to_string()));
        }
        let _held = self.locks.acquire([LockKey::Batch(batch_id)]).await;

        let batch = self.load(batch_id).await?;
        if batch.status != BatchStatus::Active {
            return Err(DispatchError::State(format!(
                "Batch {} is {}; legs can only be updated while it is active",
                batch.batch_number,
                batch.status.as_str()
            )));
        }
        let rows = self.load_rows(batch_id).await?;
        let row = rows
            .iter()
            .find(|r| r.order_id == order_id)
            .ok_or_else(|| {
                DispatchError::Validation(format!("Order {} is not part of batch {}", order_id, batch.batch_number))
            })?;

        let current = row.leg_status(leg);
        if !current.can_transition_to(status) {
            return Err(DispatchError::State(format!(
                "{} of order {} is already {}",
                leg_name(leg),
                order_id,
                current.as_str()
            )));
        }
        if leg == Leg::Delivery && status == LegStatus::Completed && row.pickup_status != LegStatus::Completed {
            return Err(DispatchError::State(format!(
                "Order {} cannot be delivered before it is picked up",
                order_id
            )));
        }

        let update = LegUpdate {
            batch_id,
            order_id,
            leg,
            target: status,
            at: Utc::now(),
        };
        let applied = with_retry(&self.retry, "update_leg", || self.batches.update_leg(&update)).await?;
        if !applied {
            return Err(DispatchError::Conflict(format!(
                "{} of order {} changed concurrently",
                leg_name(leg),
                order_id
            )));
        }
        debug!(batch_id = %batch_id, order_id = %order_id, leg = leg_name(leg), status = status.as_str(), "Leg updated");

        if status == LegStatus::Completed {
            let (expected, target) = match leg {
                Leg::Pickup => (OrderStatus::Assigned, OrderStatus::PickedUp),
                Leg::Delivery => (OrderStatus::PickedUp, OrderStatus::Delivered),
            };
            let moved = with_retry(&self.retry, "update_order_status", || {
                self.orders.update_order_status(order_id, expected, target)
            })
            .await?;
            if !moved {
                warn!(
                    order_id = %order_id,
                    expected = expected.as_str(),
                    "Order status changed outside the batch, leaving it as is"
                );
            }
        }

        let rows = self.load_rows(batch_id).await?;
        let all_delivered = rows.iter().all(|r| r.delivery_status == LegStatus::Completed);
        let batch = if leg == Leg::Delivery && status == LegStatus::Completed && all_delivered {
            info!(batch_id = %batch_id, "Last delivery completed, completing batch");
            self.transition_locked(batch_id, BatchStatus::Completed, None).await?
        } else {
            batch
        };

        let order = rows
            .into_iter()
            .find(|r| r.order_id == order_id)
            .ok_or_else(|| DispatchError::Conflict(format!("Order {} left batch {}", order_id, batch_id)))?;
        Ok(LegUpdateOutcome { order, batch })
    }

    async fn transition(
        &self,
        batch_id: Uuid,
        target: BatchStatus,
        reason: Option<&str>,
    ) -> Result<Batch, DispatchError> {
        let _held = self.locks.acquire([LockKey::Batch(batch_id)]).await;
        self.transition_locked(batch_id, target, reason).await
    }

    /// Caller holds the batch lock
    async fn transition_locked(
        &self,
        batch_id: Uuid,
        target: BatchStatus,
        reason: Option<&str>,
    ) -> Result<Batch, DispatchError> {
        let mut attempts = 0u32;
        loop {
            let batch = self.load(batch_id).await?;
            if !batch.status.can_transition_to(target) {
                return Err(DispatchError::State(format!(
                    "Batch {} is {} and cannot become {}",
                    batch.batch_number,
                    batch.status.as_str(),
                    target.as_str()
                )));
            }

            let rows = self.load_rows(batch_id).await?;
            if target == BatchStatus::Completed {
                let undelivered = rows
                    .iter()
                    .filter(|r| r.delivery_status != LegStatus::Completed)
                    .count();
                if undelivered > 0 {
                    return Err(DispatchError::State(format!(
                        "Batch {} still has {} undelivered order(s)",
                        batch.batch_number, undelivered
                    )));
                }
            }

            let transition = self.plan_transition(&batch, target, reason);
            let applied =
                with_retry(&self.retry, "transition_batch", || self.batches.transition_batch(&transition)).await?;
            if applied {
                info!(
                    batch_id = %batch_id,
                    from = batch.status.as_str(),
                    to = target.as_str(),
                    "Batch transitioned"
                );
                let updated = self.load(batch_id).await?;
                self.emit_transition(&batch, &updated, &rows, reason).await;
                return Ok(updated);
            }

            attempts += 1;
            if attempts > self.settings.conflict_max_retries {
                return Err(DispatchError::Conflict(format!(
                    "Batch {} changed concurrently while moving to {}",
                    batch.batch_number,
                    target.as_str()
                )));
            }
            debug!(batch_id = %batch_id, attempts, "Lost status race, re-reading batch");
        }
    }

    fn plan_transition(&self, batch: &Batch, target: BatchStatus, reason: Option<&str>) -> BatchTransition {
        let now = Utc::now();
        let mut t = BatchTransition::new(batch.id, batch.status, target);
        match (batch.status, target) {
            (BatchStatus::Planned, BatchStatus::Active) => {
                t.started_at = Some(now);
                t.order_effect = OrderEffect::MarkAssigned;
            }
            (_, BatchStatus::Cancelled) => {
                t.order_effect = OrderEffect::Release;
                t.release_driver = true;
                t.note = Some((
                    "cancelReason".to_string(),
                    json!(reason.unwrap_or("cancelled")),
                ));
            }
            (_, BatchStatus::Completed) => {
                t.completed_at = Some(now);
                t.release_driver = true;
            }
            _ => {}
        }
        t
    }

    async fn emit_transition(&self, before: &Batch, after: &Batch, rows: &[BatchOrder], reason: Option<&str>) {
        let event_type = match (before.status, after.status) {
            (BatchStatus::Planned, BatchStatus::Active) => BatchEventType::BatchStarted,
            (_, BatchStatus::Completed) => BatchEventType::BatchCompleted,
            (_, BatchStatus::Cancelled) => BatchEventType::BatchCancelled,
            _ => return,
        };
        let order_ids = rows.iter().map(|r| r.order_id).collect();
        let mut event = BatchEvent::new(event_type, after.id, order_ids).with_driver(after.driver_id);
        if let Some(reason) = reason {
            event = event.with_details(json!({ "reason": reason }));
        }
        emit(self.events.as_ref(), event).await;
    }

    async fn load(&self, batch_id: Uuid) -> Result<Batch, DispatchError> {
        with_retry(&self.retry, "get_batch", || self.batches.get_batch(batch_id))
            .await?
            .ok_or_else(|| DispatchError::Validation(format!("Batch {} not found", batch_id)))
    }

    async fn load_rows(&self, batch_id: Uuid) -> Result<Vec<BatchOrder>, DispatchError> {
        with_retry(&self.retry, "get_batch_orders", || self.batches.get_batch_orders(batch_id)).await
    }
}

fn leg_name(leg: Leg) -> &'static str {
    match leg {
        Leg::Pickup => "pickup",
        Leg::Delivery => "delivery",
    }
}
