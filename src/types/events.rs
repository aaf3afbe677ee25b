//! Domain events emitted by the dispatch engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kind, also used as the NATS subject suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEventType {
    BatchCreated,
    BatchStarted,
    BatchCompleted,
    BatchCancelled,
    OrderAdded,
    OrderRemoved,
    WorkloadRebalanced,
}

impl BatchEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            BatchEventType::BatchCreated => "batch_created",
            BatchEventType::BatchStarted => "batch_started",
            BatchEventType::BatchCompleted => "batch_completed",
            BatchEventType::BatchCancelled => "batch_cancelled",
            BatchEventType::OrderAdded => "order_added",
            BatchEventType::OrderRemoved => "order_removed",
            BatchEventType::WorkloadRebalanced => "workload_rebalanced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub event_type: BatchEventType,
    pub batch_id: Uuid,
    pub order_ids: Vec<Uuid>,
    pub driver_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl BatchEvent {
    pub fn new(event_type: BatchEventType, batch_id: Uuid, order_ids: Vec<Uuid>) -> Self {
        Self {
            event_type,
            batch_id,
            order_ids,
            driver_id: None,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_driver(mut self, driver_id: Uuid) -> Self {
        self.driver_id = Some(driver_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
