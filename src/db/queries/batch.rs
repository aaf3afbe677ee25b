//! Batch and batch membership queries

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::db::ports::BatchMetrics;
use crate::types::{Batch, BatchOrder, BatchStatus, Leg, LegStatus};

const BATCH_COLUMNS: &str = "id, driver_id, batch_number, status, total_distance_km, estimated_duration_minutes, \
                             optimization_score, max_orders, max_deviation_km, created_at, \
                             actual_start_time, actual_completion_time, metadata";

const ROW_COLUMNS: &str = "batch_id, order_id, pickup_sequence, delivery_sequence, pickup_status, \
                           delivery_status, actual_pickup_time, actual_delivery_time";

// ============================================================================
// Batches
// ============================================================================

pub async fn insert_batch<'e, E: PgExecutor<'e>>(executor: E, batch: &Batch) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batches (id, driver_id, batch_number, status, total_distance_km,
                             estimated_duration_minutes, optimization_score, max_orders,
                             max_deviation_km, created_at, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(batch.id)
    .bind(batch.driver_id)
    .bind(&batch.batch_number)
    .bind(batch.status)
    .bind(batch.total_distance_km)
    .bind(batch.estimated_duration_minutes)
    .bind(batch.optimization_score)
    .bind(batch.max_orders)
    .bind(batch.max_deviation_km)
    .bind(batch.created_at)
    .bind(&batch.metadata)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_batch<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> sqlx::Result<Option<Batch>> {
    let query = format!("SELECT {} FROM batches WHERE id = $1", BATCH_COLUMNS);
    sqlx::query_as::<_, Batch>(&query)
        .bind(batch_id)
        .fetch_optional(executor)
        .await
}

/// Lock the batch row for the rest of the transaction
pub async fn lock_batch<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> sqlx::Result<Option<Batch>> {
    let query = format!("SELECT {} FROM batches WHERE id = $1 FOR UPDATE", BATCH_COLUMNS);
    sqlx::query_as::<_, Batch>(&query)
        .bind(batch_id)
        .fetch_optional(executor)
        .await
}

/// Batches in any of `statuses`, oldest first
pub async fn list_batches<'e, E: PgExecutor<'e>>(
    executor: E,
    statuses: &[BatchStatus],
) -> sqlx::Result<Vec<Batch>> {
    let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let query = format!(
        "SELECT {} FROM batches WHERE status::text = ANY($1) ORDER BY created_at ASC, id ASC",
        BATCH_COLUMNS
    );
    sqlx::query_as::<_, Batch>(&query)
        .bind(statuses)
        .fetch_all(executor)
        .await
}

/// Conditional status change. Returns the batch's driver when it applied.
#[allow(clippy::too_many_arguments)]
pub async fn update_status<'e, E: PgExecutor<'e>>(
    executor: E,
    batch_id: Uuid,
    expected: BatchStatus,
    target: BatchStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    note_key: Option<&str>,
    note_value: Option<&serde_json::Value>,
) -> sqlx::Result<Option<Uuid>> {
    sqlx::query_scalar(
        r#"
        UPDATE batches
        SET status = $3,
            actual_start_time = COALESCE(actual_start_time, $4),
            actual_completion_time = COALESCE($5, actual_completion_time),
            metadata = CASE
                WHEN $6::text IS NULL THEN metadata
                ELSE metadata || jsonb_build_object($6::text, $7::jsonb)
            END,
            updated_at = NOW()
        WHERE id = $1 AND status = $2
        RETURNING driver_id
        "#,
    )
    .bind(batch_id)
    .bind(expected)
    .bind(target)
    .bind(started_at)
    .bind(completed_at)
    .bind(note_key)
    .bind(note_value)
    .fetch_optional(executor)
    .await
}

pub async fn update_metrics<'e, E: PgExecutor<'e>>(
    executor: E,
    batch_id: Uuid,
    metrics: &BatchMetrics,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE batches
        SET total_distance_km = $2, estimated_duration_minutes = $3, optimization_score = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(batch_id)
    .bind(metrics.total_distance_km)
    .bind(metrics.estimated_duration_minutes)
    .bind(metrics.optimization_score)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Hand a planned batch to another driver
pub async fn reassign<'e, E: PgExecutor<'e>>(
    executor: E,
    batch_id: Uuid,
    from_driver: Uuid,
    to_driver: Uuid,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE batches SET driver_id = $3, updated_at = NOW()
        WHERE id = $1 AND driver_id = $2 AND status = 'planned'
        "#,
    )
    .bind(batch_id)
    .bind(from_driver)
    .bind(to_driver)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Membership rows
// ============================================================================

pub async fn insert_row<'e, E: PgExecutor<'e>>(executor: E, row: &BatchOrder) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_orders (batch_id, order_id, pickup_sequence, delivery_sequence,
                                  pickup_status, delivery_status)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(row.batch_id)
    .bind(row.order_id)
    .bind(row.pickup_sequence)
    .bind(row.delivery_sequence)
    .bind(row.pickup_status)
    .bind(row.delivery_status)
    .execute(executor)
    .await?;

    Ok(())
}

/// Rows ordered by pickup sequence
pub async fn get_rows<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> sqlx::Result<Vec<BatchOrder>> {
    let query = format!(
        "SELECT {} FROM batch_orders WHERE batch_id = $1 ORDER BY pickup_sequence ASC",
        ROW_COLUMNS
    );
    sqlx::query_as::<_, BatchOrder>(&query)
        .bind(batch_id)
        .fetch_all(executor)
        .await
}

/// Whether the order or either sequence slot is already taken in the batch
pub async fn slot_taken<'e, E: PgExecutor<'e>>(executor: E, row: &BatchOrder) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM batch_orders
            WHERE batch_id = $1
              AND (order_id = $2 OR pickup_sequence = $3 OR delivery_sequence = $4)
        )
        "#,
    )
    .bind(row.batch_id)
    .bind(row.order_id)
    .bind(row.pickup_sequence)
    .bind(row.delivery_sequence)
    .fetch_one(executor)
    .await
}

/// Move one leg out of `pending`
pub async fn update_leg<'e, E: PgExecutor<'e>>(
    executor: E,
    batch_id: Uuid,
    order_id: Uuid,
    leg: Leg,
    target: LegStatus,
    completed_at: Option<DateTime<Utc>>,
) -> sqlx::Result<bool> {
    let query = match leg {
        Leg::Pickup => {
            r#"
            UPDATE batch_orders SET pickup_status = $3, actual_pickup_time = $4
            WHERE batch_id = $1 AND order_id = $2 AND pickup_status = 'pending'
            "#
        }
        Leg::Delivery => {
            r#"
            UPDATE batch_orders SET delivery_status = $3, actual_delivery_time = $4
            WHERE batch_id = $1 AND order_id = $2 AND delivery_status = 'pending'
            "#
        }
    };
    let result = sqlx::query(query)
        .bind(batch_id)
        .bind(order_id)
        .bind(target)
        .bind(completed_at)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_row<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid, order_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM batch_orders WHERE batch_id = $1 AND order_id = $2")
        .bind(batch_id)
        .bind(order_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn update_sequences<'e, E: PgExecutor<'e>>(executor: E, row: &BatchOrder) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE batch_orders SET pickup_sequence = $3, delivery_sequence = $4
        WHERE batch_id = $1 AND order_id = $2
        "#,
    )
    .bind(row.batch_id)
    .bind(row.order_id)
    .bind(row.pickup_sequence)
    .bind(row.delivery_sequence)
    .execute(executor)
    .await?;

    Ok(())
}
