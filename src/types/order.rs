//! Order types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// GPS coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Order status as seen by the dispatch engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
pub enum OrderStatus {
    Ready,
    Assigned,
    PickedUp,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Ready => "ready",
            OrderStatus::Assigned => "assigned",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Order entity (owned by the ordering service, read and claimed by dispatch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub status: OrderStatus,
    pub vendor_id: Uuid,
    pub pickup: Coordinates,
    pub delivery: Coordinates,
    pub created_at: DateTime<Utc>,
    pub estimated_delivery_time: DateTime<Utc>,
    /// Item/complexity count
    pub item_count: i32,
    pub assigned_driver_id: Option<Uuid>,
    /// Non-terminal batch currently holding this order
    pub batch_id: Option<Uuid>,
}

impl Order {
    /// Ready and not claimed by any driver or batch
    pub fn is_unassigned_ready(&self) -> bool {
        self.status == OrderStatus::Ready && self.assigned_driver_id.is_none() && self.batch_id.is_none()
    }
}
