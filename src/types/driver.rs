use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Coordinates;

/// Historical delivery performance of a driver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPerformance {
    /// Average customer rating, 0-5
    pub rating: f64,
    /// Share of on-time deliveries, 0-1
    pub on_time_rate: f64,
    pub total_deliveries: i32,
}

/// Driver entity (owned by the fleet service, read by dispatch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: Uuid,
    pub is_online: bool,
    pub is_active: bool,
    pub current_location: Option<Coordinates>,
    /// Orders the driver is currently carrying
    pub workload_count: i32,
    pub performance: Option<DriverPerformance>,
    /// Non-terminal batch held by the driver
    pub current_batch_id: Option<Uuid>,
}

impl Driver {
    pub fn is_available(&self) -> bool {
        self.is_online && self.is_active
    }

    pub fn holds_batch(&self) -> bool {
        self.current_batch_id.is_some()
    }
}
