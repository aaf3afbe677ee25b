//! Postgres implementation of the persistence ports
//!
//! Multi-row writes run in one transaction; a dropped transaction rolls
//! back, so every early `return Ok(false)` leaves the database untouched.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::ports::{
    BatchMetrics, BatchStore, BatchTransition, DriverStore, LegUpdate, OrderEffect, OrderStore, StoreResult,
};
use super::queries;
use crate::error::DispatchError;
use crate::types::{Batch, BatchOrder, BatchStatus, Driver, LegStatus, Order, OrderStatus};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn get_orders(&self, ids: &[Uuid]) -> StoreResult<Vec<Order>> {
        Ok(queries::order::get_orders(&self.pool, ids).await?)
    }

    async fn list_ready_unassigned(&self, limit: i64) -> StoreResult<Vec<Order>> {
        Ok(queries::order::list_ready_unassigned(&self.pool, limit).await?)
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> StoreResult<bool> {
        Ok(queries::order::update_status(&self.pool, order_id, expected, target).await?)
    }
}

#[async_trait]
impl DriverStore for PgStore {
    async fn list_available_drivers(&self) -> StoreResult<Vec<Driver>> {
        Ok(queries::driver::list_available(&self.pool).await?)
    }

    async fn get_driver(&self, driver_id: Uuid) -> StoreResult<Option<Driver>> {
        Ok(queries::driver::get_driver(&self.pool, driver_id).await?)
    }

    async fn set_current_batch(
        &self,
        driver_id: Uuid,
        expected: Option<Uuid>,
        target: Option<Uuid>,
    ) -> StoreResult<bool> {
        Ok(queries::driver::set_current_batch(&self.pool, driver_id, expected, target).await?)
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn create_batch(&self, batch: &Batch, rows: &[BatchOrder]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let claimed = queries::driver::set_current_batch(&mut *tx, batch.driver_id, None, Some(batch.id)).await?;
        if !claimed {
            if queries::driver::exists(&mut *tx, batch.driver_id).await? {
                return Err(DispatchError::Conflict(format!(
                    "driver {} already holds a batch",
                    batch.driver_id
                )));
            }
            return Err(DispatchError::Validation(format!("unknown driver {}", batch.driver_id)));
        }

        // The partial unique index on open batches per driver reports 23505 -> Conflict
        queries::batch::insert_batch(&mut *tx, batch).await?;

        let order_ids: Vec<Uuid> = rows.iter().map(|r| r.order_id).collect();
        let count = queries::order::claim_for_batch(
            &mut *tx,
            &order_ids,
            batch.driver_id,
            batch.id,
            OrderStatus::Ready,
        )
        .await?;
        if count != order_ids.len() as u64 {
            let existing = queries::order::count_existing(&mut *tx, &order_ids).await?;
            if existing != order_ids.len() as i64 {
                return Err(DispatchError::Validation("batch references unknown orders".to_string()));
            }
            return Err(DispatchError::Conflict("an order is already claimed".to_string()));
        }

        for row in rows {
            queries::batch::insert_row(&mut *tx, row).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        Ok(queries::batch::get_batch(&self.pool, batch_id).await?)
    }

    async fn get_batch_orders(&self, batch_id: Uuid) -> StoreResult<Vec<BatchOrder>> {
        Ok(queries::batch::get_rows(&self.pool, batch_id).await?)
    }

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        Ok(queries::batch::list_batches(&self.pool, statuses).await?)
    }

    async fn transition_batch(&self, t: &BatchTransition) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let (note_key, note_value) = match &t.note {
            Some((key, value)) => (Some(key.as_str()), Some(value)),
            None => (None, None),
        };
        let driver_id = queries::batch::update_status(
            &mut *tx,
            t.batch_id,
            t.expected,
            t.target,
            t.started_at,
            t.completed_at,
            note_key,
            note_value,
        )
        .await?;
        let Some(driver_id) = driver_id else {
            return Ok(false);
        };

        match t.order_effect {
            OrderEffect::None => {}
            OrderEffect::MarkAssigned => {
                queries::order::mark_members_assigned(&mut *tx, t.batch_id).await?;
            }
            OrderEffect::Release => {
                queries::order::release_members(&mut *tx, t.batch_id).await?;
            }
        }
        if t.release_driver {
            queries::driver::set_current_batch(&mut *tx, driver_id, Some(t.batch_id), None).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_leg(&self, update: &LegUpdate) -> StoreResult<bool> {
        let completed_at = (update.target == LegStatus::Completed).then_some(update.at);
        Ok(queries::batch::update_leg(
            &self.pool,
            update.batch_id,
            update.order_id,
            update.leg,
            update.target,
            completed_at,
        )
        .await?)
    }

    async fn attach_order(
        &self,
        row: &BatchOrder,
        driver_id: Uuid,
        order_status: OrderStatus,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        match queries::batch::lock_batch(&mut *tx, row.batch_id).await? {
            Some(batch) if !batch.status.is_terminal() && batch.driver_id == driver_id => {}
            _ => return Ok(false),
        }
        if queries::batch::slot_taken(&mut *tx, row).await? {
            return Ok(false);
        }
        let claimed =
            queries::order::claim_for_batch(&mut *tx, &[row.order_id], driver_id, row.batch_id, order_status).await?;
        if claimed != 1 {
            return Ok(false);
        }
        queries::batch::insert_row(&mut *tx, row).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn detach_order(
        &self,
        batch_id: Uuid,
        order_id: Uuid,
        resequenced: &[BatchOrder],
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        match queries::batch::lock_batch(&mut *tx, batch_id).await? {
            Some(batch) if !batch.status.is_terminal() => {}
            _ => return Ok(false),
        }
        if !queries::order::release(&mut *tx, order_id).await? {
            return Ok(false);
        }
        if !queries::batch::delete_row(&mut *tx, batch_id, order_id).await? {
            return Ok(false);
        }
        for row in resequenced.iter().filter(|r| r.order_id != order_id) {
            queries::batch::update_sequences(&mut *tx, row).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_metrics(&self, batch_id: Uuid, metrics: &BatchMetrics) -> StoreResult<()> {
        if !queries::batch::update_metrics(&self.pool, batch_id, metrics).await? {
            return Err(DispatchError::Validation(format!("unknown batch {}", batch_id)));
        }
        Ok(())
    }

    async fn reassign_batch(&self, batch_id: Uuid, from_driver: Uuid, to_driver: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        if !queries::batch::reassign(&mut *tx, batch_id, from_driver, to_driver).await? {
            return Ok(false);
        }
        queries::order::reassign_members(&mut *tx, batch_id, to_driver).await?;

        tx.commit().await?;
        Ok(true)
    }
}
