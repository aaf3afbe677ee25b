//! In-process store
//!
//! Implements the same conditional-write contract as the Postgres store
//! behind a single mutex. Backs the engine tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::ports::{
    BatchMetrics, BatchStore, BatchTransition, DriverStore, LegUpdate, OrderEffect, OrderStore, StoreResult,
};
use crate::error::DispatchError;
use crate::types::{Batch, BatchOrder, BatchStatus, Driver, Leg, LegStatus, Order, OrderStatus};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    drivers: HashMap<Uuid, Driver>,
    batches: HashMap<Uuid, Batch>,
    rows: HashMap<Uuid, Vec<BatchOrder>>,
    /// Upcoming calls that fail with a transient error
    injected_failures: usize,
    /// Return `get_orders` results in reverse request order
    reverse_reads: bool,
}

impl State {
    fn check_fault(&mut self) -> StoreResult<()> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(DispatchError::Store("injected failure".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: Order) {
        self.state.lock().orders.insert(order.id, order);
    }

    pub fn insert_driver(&self, driver: Driver) {
        self.state.lock().drivers.insert(driver.id, driver);
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.state.lock().orders.get(&id).cloned()
    }

    pub fn driver(&self, id: Uuid) -> Option<Driver> {
        self.state.lock().drivers.get(&id).cloned()
    }

    pub fn batch(&self, id: Uuid) -> Option<Batch> {
        self.state.lock().batches.get(&id).cloned()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.state.lock().batches.values().cloned().collect()
    }

    /// Answer `get_orders` back to front, like a heap scan that ignores the request order
    pub fn reverse_order_reads(&self) {
        self.state.lock().reverse_reads = true;
    }

    /// Make the next `count` store calls fail with `DispatchError::Store`
    pub fn inject_failures(&self, count: usize) {
        self.state.lock().injected_failures = count;
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn get_orders(&self, ids: &[Uuid]) -> StoreResult<Vec<Order>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let mut orders: Vec<Order> = ids.iter().filter_map(|id| state.orders.get(id).cloned()).collect();
        if state.reverse_reads {
            orders.reverse();
        }
        Ok(orders)
    }

    async fn list_ready_unassigned(&self, limit: i64) -> StoreResult<Vec<Order>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.is_unassigned_ready())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;
        match state.orders.get_mut(&order_id) {
            Some(order) if order.status == expected => {
                order.status = target;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl DriverStore for InMemoryStore {
    async fn list_available_drivers(&self) -> StoreResult<Vec<Driver>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let mut drivers: Vec<Driver> = state.drivers.values().filter(|d| d.is_available()).cloned().collect();
        drivers.sort_by_key(|d| d.id);
        Ok(drivers)
    }

    async fn get_driver(&self, driver_id: Uuid) -> StoreResult<Option<Driver>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        Ok(state.drivers.get(&driver_id).cloned())
    }

    async fn set_current_batch(
        &self,
        driver_id: Uuid,
        expected: Option<Uuid>,
        target: Option<Uuid>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;
        match state.drivers.get_mut(&driver_id) {
            Some(driver) if driver.current_batch_id == expected => {
                driver.current_batch_id = target;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl BatchStore for InMemoryStore {
    async fn create_batch(&self, batch: &Batch, rows: &[BatchOrder]) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.check_fault()?;

        if state.batches.contains_key(&batch.id) {
            return Err(DispatchError::Conflict(format!("batch {} already exists", batch.id)));
        }
        match state.drivers.get(&batch.driver_id) {
            Some(driver) if driver.current_batch_id.is_none() => {}
            Some(_) => {
                return Err(DispatchError::Conflict(format!(
                    "driver {} already holds a batch",
                    batch.driver_id
                )))
            }
            None => return Err(DispatchError::Validation(format!("unknown driver {}", batch.driver_id))),
        }
        let driver_busy = state
            .batches
            .values()
            .any(|b| b.driver_id == batch.driver_id && !b.status.is_terminal());
        if driver_busy {
            return Err(DispatchError::Conflict(format!(
                "driver {} already holds a batch",
                batch.driver_id
            )));
        }
        for row in rows {
            match state.orders.get(&row.order_id) {
                Some(order) if order.is_unassigned_ready() => {}
                Some(_) => {
                    return Err(DispatchError::Conflict(format!("order {} is already claimed", row.order_id)))
                }
                None => return Err(DispatchError::Validation(format!("unknown order {}", row.order_id))),
            }
        }

        for row in rows {
            if let Some(order) = state.orders.get_mut(&row.order_id) {
                order.assigned_driver_id = Some(batch.driver_id);
                order.batch_id = Some(batch.id);
            }
        }
        if let Some(driver) = state.drivers.get_mut(&batch.driver_id) {
            driver.current_batch_id = Some(batch.id);
        }
        let mut rows = rows.to_vec();
        rows.sort_by_key(|r| r.pickup_sequence);
        state.rows.insert(batch.id, rows);
        state.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        Ok(state.batches.get(&batch_id).cloned())
    }

    async fn get_batch_orders(&self, batch_id: Uuid) -> StoreResult<Vec<BatchOrder>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let mut rows = state.rows.get(&batch_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.pickup_sequence);
        Ok(rows)
    }

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(batches)
    }

    async fn transition_batch(&self, t: &BatchTransition) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;

        let driver_id = match state.batches.get_mut(&t.batch_id) {
            Some(batch) if batch.status == t.expected => {
                batch.status = t.target;
                if batch.actual_start_time.is_none() {
                    batch.actual_start_time = t.started_at;
                }
                if t.completed_at.is_some() {
                    batch.actual_completion_time = t.completed_at;
                }
                if let Some((key, value)) = &t.note {
                    if !batch.metadata.is_object() {
                        batch.metadata = serde_json::json!({});
                    }
                    if let Some(map) = batch.metadata.as_object_mut() {
                        map.insert(key.clone(), value.clone());
                    }
                }
                batch.driver_id
            }
            _ => return Ok(false),
        };

        let member_ids: Vec<Uuid> = state
            .rows
            .get(&t.batch_id)
            .map(|rows| rows.iter().map(|r| r.order_id).collect())
            .unwrap_or_default();
        for order_id in member_ids {
            let Some(order) = state.orders.get_mut(&order_id) else {
                continue;
            };
            match t.order_effect {
                OrderEffect::None => {}
                OrderEffect::MarkAssigned => {
                    if order.status == OrderStatus::Ready {
                        order.status = OrderStatus::Assigned;
                    }
                }
                OrderEffect::Release => {
                    if !matches!(order.status, OrderStatus::Delivered | OrderStatus::Cancelled) {
                        order.status = OrderStatus::Ready;
                        order.assigned_driver_id = None;
                        order.batch_id = None;
                    }
                }
            }
        }

        if t.release_driver {
            if let Some(driver) = state.drivers.get_mut(&driver_id) {
                if driver.current_batch_id == Some(t.batch_id) {
                    driver.current_batch_id = None;
                }
            }
        }
        Ok(true)
    }

    async fn update_leg(&self, update: &LegUpdate) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let Some(row) = state
            .rows
            .get_mut(&update.batch_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.order_id == update.order_id))
        else {
            return Ok(false);
        };
        let completed_at = (update.target == LegStatus::Completed).then_some(update.at);
        match update.leg {
            Leg::Pickup if row.pickup_status == LegStatus::Pending => {
                row.pickup_status = update.target;
                row.actual_pickup_time = completed_at;
                Ok(true)
            }
            Leg::Delivery if row.delivery_status == LegStatus::Pending => {
                row.delivery_status = update.target;
                row.actual_delivery_time = completed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_order(
        &self,
        row: &BatchOrder,
        driver_id: Uuid,
        order_status: OrderStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;

        let batch_ok = state
            .batches
            .get(&row.batch_id)
            .is_some_and(|b| !b.status.is_terminal() && b.driver_id == driver_id);
        let order_ok = state.orders.get(&row.order_id).is_some_and(|o| o.is_unassigned_ready());
        let slot_free = state.rows.get(&row.batch_id).map_or(true, |rows| {
            rows.iter().all(|r| {
                r.order_id != row.order_id
                    && r.pickup_sequence != row.pickup_sequence
                    && r.delivery_sequence != row.delivery_sequence
            })
        });
        if !(batch_ok && order_ok && slot_free) {
            return Ok(false);
        }

        if let Some(order) = state.orders.get_mut(&row.order_id) {
            order.status = order_status;
            order.assigned_driver_id = Some(driver_id);
            order.batch_id = Some(row.batch_id);
        }
        let rows = state.rows.entry(row.batch_id).or_default();
        rows.push(row.clone());
        rows.sort_by_key(|r| r.pickup_sequence);
        Ok(true)
    }

    async fn detach_order(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        resequenced: &[BatchOrder],
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;

        let batch_ok = state.batches.get(&batch_id).is_some_and(|b| !b.status.is_terminal());
        let member = state
            .rows
            .get(&batch_id)
            .is_some_and(|rows| rows.iter().any(|r| r.order_id == order_id));
        let deliverable = state
            .orders
            .get(&order_id)
            .is_some_and(|o| o.status != OrderStatus::Delivered);
        if !(batch_ok && member && deliverable) {
            return Ok(false);
        }

        if let Some(rows) = state.rows.get_mut(&batch_id) {
            rows.retain(|r| r.order_id != order_id);
            for row in rows.iter_mut() {
                if let Some(updated) = resequenced.iter().find(|u| u.order_id == row.order_id) {
                    row.pickup_sequence = updated.pickup_sequence;
                    row.delivery_sequence = updated.delivery_sequence;
                }
            }
            rows.sort_by_key(|r| r.pickup_sequence);
        }
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Ready;
            order.assigned_driver_id = None;
            order.batch_id = None;
        }
        Ok(true)
    }

    async fn update_metrics(&self, batch_id: Uuid, metrics: &BatchMetrics) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.check_fault()?;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| DispatchError::Validation(format!("unknown batch {}", batch_id)))?;
        batch.total_distance_km = metrics.total_distance_km;
        batch.estimated_duration_minutes = metrics.estimated_duration_minutes;
        batch.optimization_score = metrics.optimization_score;
        Ok(())
    }

    async fn reassign_batch(&self, batch_id: Uuid, from_driver: Uuid, to_driver: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.check_fault()?;
        match state.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Planned && batch.driver_id == from_driver => {
                batch.driver_id = to_driver;
            }
            _ => return Ok(false),
        }
        let member_ids: Vec<Uuid> = state
            .rows
            .get(&batch_id)
            .map(|rows| rows.iter().map(|r| r.order_id).collect())
            .unwrap_or_default();
        for order_id in member_ids {
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.assigned_driver_id = Some(to_driver);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// Test fixtures
// ============================================================================

#[cfg(test)]
pub mod fixtures {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use crate::types::{Coordinates, Driver, DriverPerformance, Order, OrderStatus};

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    /// Ready order with the delivery point ~1 km north-east of the pickup
    pub fn order(vendor: Uuid, lat: f64, lng: f64, minutes: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            status: OrderStatus::Ready,
            vendor_id: vendor,
            pickup: Coordinates::new(lat, lng),
            delivery: Coordinates::new(lat + 0.006, lng + 0.006),
            created_at: base_time() + Duration::minutes(minutes),
            estimated_delivery_time: base_time() + Duration::minutes(30 + minutes),
            item_count: 1,
            assigned_driver_id: None,
            batch_id: None,
        }
    }

    pub fn driver(lat: f64, lng: f64) -> Driver {
        Driver {
            id: Uuid::new_v4(),
            is_online: true,
            is_active: true,
            current_location: Some(Coordinates::new(lat, lng)),
            workload_count: 0,
            performance: Some(DriverPerformance {
                rating: 4.5,
                on_time_rate: 0.9,
                total_deliveries: 50,
            }),
            current_batch_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::types::batch_number;
    use tokio_test::{assert_err, assert_ok};

    fn planned_batch(driver_id: Uuid) -> Batch {
        let id = Uuid::new_v4();
        Batch {
            id,
            driver_id,
            batch_number: batch_number(id, base_time()),
            status: BatchStatus::Planned,
            total_distance_km: 2.0,
            estimated_duration_minutes: 3,
            optimization_score: 96.0,
            max_orders: 3,
            max_deviation_km: 5.0,
            created_at: base_time(),
            actual_start_time: None,
            actual_completion_time: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_batch_claims_driver_and_orders() {
        let store = InMemoryStore::new();
        let d = driver(3.1, 101.6);
        let o = order(Uuid::new_v4(), 3.1, 101.6, 0);
        store.insert_driver(d.clone());
        store.insert_order(o.clone());

        let batch = planned_batch(d.id);
        let rows = vec![BatchOrder::pending(batch.id, o.id, 1, 1)];
        assert_ok!(store.create_batch(&batch, &rows).await);

        assert_eq!(store.driver(d.id).unwrap().current_batch_id, Some(batch.id));
        let claimed = store.order(o.id).unwrap();
        assert_eq!(claimed.assigned_driver_id, Some(d.id));
        assert_eq!(claimed.batch_id, Some(batch.id));
        assert!(store.list_ready_unassigned(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_batch_for_same_driver_conflicts() {
        let store = InMemoryStore::new();
        let d = driver(3.1, 101.6);
        let o1 = order(Uuid::new_v4(), 3.1, 101.6, 0);
        let o2 = order(Uuid::new_v4(), 3.1, 101.6, 1);
        store.insert_driver(d.clone());
        store.insert_order(o1.clone());
        store.insert_order(o2.clone());

        let first = planned_batch(d.id);
        assert_ok!(store.create_batch(&first, &[BatchOrder::pending(first.id, o1.id, 1, 1)]).await);

        let second = planned_batch(d.id);
        let err = store
            .create_batch(&second, &[BatchOrder::pending(second.id, o2.id, 1, 1)])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.order(o2.id).unwrap().is_unassigned_ready());
    }

    #[tokio::test]
    async fn test_claimed_order_conflicts() {
        let store = InMemoryStore::new();
        let d1 = driver(3.1, 101.6);
        let d2 = driver(3.1, 101.6);
        let o = order(Uuid::new_v4(), 3.1, 101.6, 0);
        store.insert_driver(d1.clone());
        store.insert_driver(d2.clone());
        store.insert_order(o.clone());

        let first = planned_batch(d1.id);
        assert_ok!(store.create_batch(&first, &[BatchOrder::pending(first.id, o.id, 1, 1)]).await);
        let second = planned_batch(d2.id);
        let result = store.create_batch(&second, &[BatchOrder::pending(second.id, o.id, 1, 1)]).await;
        assert_err!(result);
        assert!(store.driver(d2.id).unwrap().current_batch_id.is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let d = driver(3.1, 101.6);
        let o = order(Uuid::new_v4(), 3.1, 101.6, 0);
        store.insert_driver(d.clone());
        store.insert_order(o.clone());
        let batch = planned_batch(d.id);
        assert_ok!(store.create_batch(&batch, &[BatchOrder::pending(batch.id, o.id, 1, 1)]).await);

        let mut start = BatchTransition::new(batch.id, BatchStatus::Planned, BatchStatus::Active);
        start.order_effect = OrderEffect::MarkAssigned;
        assert!(store.transition_batch(&start).await.unwrap());
        // Second identical transition loses the race
        assert!(!store.transition_batch(&start).await.unwrap());
        assert_eq!(store.order(o.id).unwrap().status, OrderStatus::Assigned);
    }

    #[tokio::test]
    async fn test_release_resets_orders_and_driver() {
        let store = InMemoryStore::new();
        let d = driver(3.1, 101.6);
        let o = order(Uuid::new_v4(), 3.1, 101.6, 0);
        store.insert_driver(d.clone());
        store.insert_order(o.clone());
        let batch = planned_batch(d.id);
        assert_ok!(store.create_batch(&batch, &[BatchOrder::pending(batch.id, o.id, 1, 1)]).await);

        let mut cancel = BatchTransition::new(batch.id, BatchStatus::Planned, BatchStatus::Cancelled);
        cancel.order_effect = OrderEffect::Release;
        cancel.release_driver = true;
        cancel.note = Some(("cancelReason".into(), serde_json::json!("vendor closed")));
        assert!(store.transition_batch(&cancel).await.unwrap());

        assert!(store.order(o.id).unwrap().is_unassigned_ready());
        assert!(store.driver(d.id).unwrap().current_batch_id.is_none());
        assert_eq!(store.batch(batch.id).unwrap().metadata["cancelReason"], "vendor closed");
    }

    #[tokio::test]
    async fn test_leg_only_leaves_pending_once() {
        let store = InMemoryStore::new();
        let d = driver(3.1, 101.6);
        let o = order(Uuid::new_v4(), 3.1, 101.6, 0);
        store.insert_driver(d.clone());
        store.insert_order(o.clone());
        let batch = planned_batch(d.id);
        assert_ok!(store.create_batch(&batch, &[BatchOrder::pending(batch.id, o.id, 1, 1)]).await);

        let update = LegUpdate {
            batch_id: batch.id,
            order_id: o.id,
            leg: Leg::Pickup,
            target: LegStatus::Completed,
            at: base_time(),
        };
        assert!(store.update_leg(&update).await.unwrap());
        assert!(!store.update_leg(&update).await.unwrap());
        let rows = store.get_batch_orders(batch.id).await.unwrap();
        assert_eq!(rows[0].pickup_status, LegStatus::Completed);
        assert_eq!(rows[0].actual_pickup_time, Some(base_time()));
        assert_eq!(rows[0].delivery_status, LegStatus::Pending);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_consumed() {
        let store = InMemoryStore::new();
        store.inject_failures(1);
        let err = store.list_available_drivers().await.unwrap_err();
        assert!(err.is_transient());
        assert_ok!(store.list_available_drivers().await);
    }
}
