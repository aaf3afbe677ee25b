//! Persistence ports consumed by the dispatch engine.
//!
//! Every method that changes state is a conditional write: it only applies
//! when the rows are still in the expected state and reports `false`
//! otherwise. The one-batch-per-driver and one-batch-per-order rules
//! live here, not in the callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::types::{Batch, BatchOrder, BatchStatus, Driver, Leg, LegStatus, Order, OrderStatus};

pub type StoreResult<T> = Result<T, DispatchError>;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Orders by id, in no guaranteed order; unknown ids are absent from the result
    async fn get_orders(&self, ids: &[Uuid]) -> StoreResult<Vec<Order>>;

    /// Ready, unclaimed orders, oldest first
    async fn list_ready_unassigned(&self, limit: i64) -> StoreResult<Vec<Order>>;

    /// Conditional status update
    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait DriverStore: Send + Sync {
    /// Online and active drivers
    async fn list_available_drivers(&self) -> StoreResult<Vec<Driver>>;

    async fn get_driver(&self, driver_id: Uuid) -> StoreResult<Option<Driver>>;

    /// Conditional update of the driver's current batch reference
    async fn set_current_batch(
        &self,
        driver_id: Uuid,
        expected: Option<Uuid>,
        target: Option<Uuid>,
    ) -> StoreResult<bool>;
}

/// What a batch status transition does to its member orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEffect {
    None,
    /// Claimed `ready` members become `assigned`
    MarkAssigned,
    /// Undelivered members go back to the pool as `ready` and unassigned
    Release,
}

/// Conditional batch status change and its side effects, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTransition {
    pub batch_id: Uuid,
    pub expected: BatchStatus,
    pub target: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub order_effect: OrderEffect,
    /// Clear the driver's current batch reference
    pub release_driver: bool,
    /// Metadata entry merged into `Batch.metadata`
    pub note: Option<(String, serde_json::Value)>,
}

impl BatchTransition {
    pub fn new(batch_id: Uuid, expected: BatchStatus, target: BatchStatus) -> Self {
        Self {
            batch_id,
            expected,
            target,
            started_at: None,
            completed_at: None,
            order_effect: OrderEffect::None,
            release_driver: false,
            note: None,
        }
    }
}

/// Conditional `pending -> target` change of one pickup or delivery leg
#[derive(Debug, Clone, PartialEq)]
pub struct LegUpdate {
    pub batch_id: Uuid,
    pub order_id: Uuid,
    pub leg: Leg,
    pub target: LegStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub total_distance_km: f64,
    pub estimated_duration_minutes: i32,
    pub optimization_score: f64,
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert the batch and its rows in one unit, claiming the driver and
    /// every order. Fails with `Conflict` when any claim is already taken.
    async fn create_batch(&self, batch: &Batch, rows: &[BatchOrder]) -> StoreResult<()>;

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>>;

    /// Membership rows ordered by pickup sequence
    async fn get_batch_orders(&self, batch_id: Uuid) -> StoreResult<Vec<BatchOrder>>;

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>>;

    async fn transition_batch(&self, transition: &BatchTransition) -> StoreResult<bool>;

    async fn update_leg(&self, update: &LegUpdate) -> StoreResult<bool>;

    /// Claim a ready, unassigned order for the batch's driver and insert its
    /// row, or do nothing
    async fn attach_order(
        &self,
        row: &BatchOrder,
        driver_id: Uuid,
        order_status: OrderStatus,
    ) -> StoreResult<bool>;

    /// Delete the order's row, release the order and rewrite the remaining
    /// rows' sequences, or do nothing
    async fn detach_order(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        resequenced: &[BatchOrder],
    ) -> StoreResult<bool>;

    async fn update_metrics(&self, batch_id: Uuid, metrics: &BatchMetrics) -> StoreResult<()>;

    /// Move a planned batch (and its member orders) from one driver to another
    async fn reassign_batch(&self, batch_id: Uuid, from_driver: Uuid, to_driver: Uuid) -> StoreResult<bool>;
}
