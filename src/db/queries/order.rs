//! Order queries

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::types::{Coordinates, Order, OrderStatus};

/// Flat `orders` row
#[derive(Debug, FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub status: OrderStatus,
    pub vendor_id: Uuid,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub delivery_lat: f64,
    pub delivery_lng: f64,
    pub created_at: DateTime<Utc>,
    pub estimated_delivery_time: DateTime<Utc>,
    pub item_count: i32,
    pub assigned_driver_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id,
            status: row.status,
            vendor_id: row.vendor_id,
            pickup: Coordinates::new(row.pickup_lat, row.pickup_lng),
            delivery: Coordinates::new(row.delivery_lat, row.delivery_lng),
            created_at: row.created_at,
            estimated_delivery_time: row.estimated_delivery_time,
            item_count: row.item_count,
            assigned_driver_id: row.assigned_driver_id,
            batch_id: row.batch_id,
        }
    }
}

/// Get orders by id, in the order of `ids`
pub async fn get_orders<'e, E: PgExecutor<'e>>(executor: E, ids: &[Uuid]) -> sqlx::Result<Vec<Order>> {
    let rows = sqlx::query_as::<_, OrderRow>(
        r#"
        SELECT id, status, vendor_id, pickup_lat, pickup_lng, delivery_lat, delivery_lng,
               created_at, estimated_delivery_time, item_count, assigned_driver_id, batch_id
        FROM orders
        WHERE id = ANY($1)
        ORDER BY array_position($1, id)
        "#,
    )
    .bind(ids)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Order::from).collect())
}

/// Ready orders not claimed by any driver or batch, oldest first
pub async fn list_ready_unassigned<'e, E: PgExecutor<'e>>(executor: E, limit: i64) -> sqlx::Result<Vec<Order>> {
    let rows = sqlx::query_as::<_, OrderRow>(
        r#"
        SELECT id, status, vendor_id, pickup_lat, pickup_lng, delivery_lat, delivery_lng,
               created_at, estimated_delivery_time, item_count, assigned_driver_id, batch_id
        FROM orders
        WHERE status = 'ready' AND assigned_driver_id IS NULL AND batch_id IS NULL
        ORDER BY created_at ASC, id ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Order::from).collect())
}

/// Change the status only if it still equals `expected`
pub async fn update_status<'e, E: PgExecutor<'e>>(
    executor: E,
    order_id: Uuid,
    expected: OrderStatus,
    target: OrderStatus,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE orders SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
    )
    .bind(order_id)
    .bind(expected)
    .bind(target)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Claim unassigned ready orders for a batch. Returns the number claimed.
pub async fn claim_for_batch<'e, E: PgExecutor<'e>>(
    executor: E,
    order_ids: &[Uuid],
    driver_id: Uuid,
    batch_id: Uuid,
    status: OrderStatus,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET status = $4, assigned_driver_id = $2, batch_id = $3, updated_at = NOW()
        WHERE id = ANY($1)
          AND status = 'ready' AND assigned_driver_id IS NULL AND batch_id IS NULL
        "#,
    )
    .bind(order_ids)
    .bind(driver_id)
    .bind(batch_id)
    .bind(status)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Number of the given ids that exist
pub async fn count_existing<'e, E: PgExecutor<'e>>(executor: E, order_ids: &[Uuid]) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE id = ANY($1)")
        .bind(order_ids)
        .fetch_one(executor)
        .await
}

/// `ready` members of a batch become `assigned`
pub async fn mark_members_assigned<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE orders SET status = 'assigned', updated_at = NOW()
        WHERE id IN (SELECT order_id FROM batch_orders WHERE batch_id = $1)
          AND status = 'ready'
        "#,
    )
    .bind(batch_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Undelivered members of a batch go back to the pool
pub async fn release_members<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET status = 'ready', assigned_driver_id = NULL, batch_id = NULL, updated_at = NOW()
        WHERE id IN (SELECT order_id FROM batch_orders WHERE batch_id = $1)
          AND status NOT IN ('delivered', 'cancelled')
        "#,
    )
    .bind(batch_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Return a single order to the pool unless it was delivered
pub async fn release<'e, E: PgExecutor<'e>>(executor: E, order_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET status = 'ready', assigned_driver_id = NULL, batch_id = NULL, updated_at = NOW()
        WHERE id = $1 AND status <> 'delivered'
        "#,
    )
    .bind(order_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Point every member of a batch at a new driver
pub async fn reassign_members<'e, E: PgExecutor<'e>>(
    executor: E,
    batch_id: Uuid,
    driver_id: Uuid,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE orders SET assigned_driver_id = $2, updated_at = NOW()
        WHERE id IN (SELECT order_id FROM batch_orders WHERE batch_id = $1)
        "#,
    )
    .bind(batch_id)
    .bind(driver_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
