//! Driver queries

use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::types::{Coordinates, Driver, DriverPerformance};

#[derive(Debug, FromRow)]
pub struct DriverRow {
    pub id: Uuid,
    pub is_online: bool,
    pub is_active: bool,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub workload_count: i32,
    pub rating: Option<f64>,
    pub on_time_rate: Option<f64>,
    pub total_deliveries: Option<i32>,
    pub current_batch_id: Option<Uuid>,
}

impl From<DriverRow> for Driver {
    fn from(row: DriverRow) -> Self {
        let current_location = match (row.current_lat, row.current_lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        };
        // Partial history counts as no history
        let performance = match (row.rating, row.on_time_rate, row.total_deliveries) {
            (Some(rating), Some(on_time_rate), Some(total_deliveries)) => Some(DriverPerformance {
                rating,
                on_time_rate,
                total_deliveries,
            }),
            _ => None,
        };
        Driver {
            id: row.id,
            is_online: row.is_online,
            is_active: row.is_active,
            current_location,
            workload_count: row.workload_count,
            performance,
            current_batch_id: row.current_batch_id,
        }
    }
}

const DRIVER_COLUMNS: &str = "id, is_online, is_active, current_lat, current_lng, workload_count, \
                              rating, on_time_rate, total_deliveries, current_batch_id";

/// Online and active drivers ordered by id
pub async fn list_available<'e, E: PgExecutor<'e>>(executor: E) -> sqlx::Result<Vec<Driver>> {
    let query = format!(
        "SELECT {} FROM drivers WHERE is_online AND is_active ORDER BY id",
        DRIVER_COLUMNS
    );
    let rows = sqlx::query_as::<_, DriverRow>(&query).fetch_all(executor).await?;
    Ok(rows.into_iter().map(Driver::from).collect())
}

pub async fn get_driver<'e, E: PgExecutor<'e>>(executor: E, driver_id: Uuid) -> sqlx::Result<Option<Driver>> {
    let query = format!("SELECT {} FROM drivers WHERE id = $1", DRIVER_COLUMNS);
    let row = sqlx::query_as::<_, DriverRow>(&query)
        .bind(driver_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(Driver::from))
}

/// Swap the current batch reference if it still equals `expected`
pub async fn set_current_batch<'e, E: PgExecutor<'e>>(
    executor: E,
    driver_id: Uuid,
    expected: Option<Uuid>,
    target: Option<Uuid>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE drivers SET current_batch_id = $3, updated_at = NOW()
        WHERE id = $1 AND current_batch_id IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(driver_id)
    .bind(expected)
    .bind(target)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn exists<'e, E: PgExecutor<'e>>(executor: E, driver_id: Uuid) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM drivers WHERE id = $1)")
        .bind(driver_id)
        .fetch_one(executor)
        .await
}
