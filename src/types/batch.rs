//! Batch types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Batch entity (one driver's combined pickup + delivery trip)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub batch_number: String,
    pub status: BatchStatus,
    pub total_distance_km: f64,
    pub estimated_duration_minutes: i32,
    pub optimization_score: f64,
    pub max_orders: i32,
    pub max_deviation_km: f64,
    pub created_at: DateTime<Utc>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_completion_time: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Batch status
///
/// ```text
/// planned -> active <-> paused
/// planned | active | paused -> cancelled
/// active | paused -> completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
pub enum BatchStatus {
    Planned,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub const NON_TERMINAL: [BatchStatus; 3] = [BatchStatus::Planned, BatchStatus::Active, BatchStatus::Paused];

    pub const fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Planned => "planned",
            BatchStatus::Active => "active",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled)
    }

    pub fn can_transition_to(self, target: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, target),
            (Planned, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Planned, Cancelled)
                | (Active, Cancelled)
                | (Paused, Cancelled)
                | (Active, Completed)
                | (Paused, Completed)
        )
    }
}

/// Status of a single pickup or delivery leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "leg_status", rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl LegStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            LegStatus::Pending => "pending",
            LegStatus::Completed => "completed",
            LegStatus::Failed => "failed",
            LegStatus::Skipped => "skipped",
        }
    }

    /// Legs only ever leave `pending`
    pub fn can_transition_to(self, target: LegStatus) -> bool {
        self == LegStatus::Pending && target != LegStatus::Pending
    }
}

/// Which half of an order's trip a leg update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Pickup,
    Delivery,
}

/// Batch membership row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BatchOrder {
    pub batch_id: Uuid,
    pub order_id: Uuid,
    /// 1-based, unique within the batch
    pub pickup_sequence: i32,
    /// 1-based, unique within the batch
    pub delivery_sequence: i32,
    pub pickup_status: LegStatus,
    pub delivery_status: LegStatus,
    pub actual_pickup_time: Option<DateTime<Utc>>,
    pub actual_delivery_time: Option<DateTime<Utc>>,
}

impl BatchOrder {
    pub fn pending(batch_id: Uuid, order_id: Uuid, pickup_sequence: i32, delivery_sequence: i32) -> Self {
        Self {
            batch_id,
            order_id,
            pickup_sequence,
            delivery_sequence,
            pickup_status: LegStatus::Pending,
            delivery_status: LegStatus::Pending,
            actual_pickup_time: None,
            actual_delivery_time: None,
        }
    }

    pub fn leg_status(&self, leg: Leg) -> LegStatus {
        match leg {
            Leg::Pickup => self.pickup_status,
            Leg::Delivery => self.delivery_status,
        }
    }
}

/// Human readable batch reference, e.g. `B20261019-1a2b3c4d`
pub fn batch_number(id: Uuid, created_at: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!("B{}-{}", created_at.format("%Y%m%d"), &simple[..8])
}

// ============================================================================
// Request / response payloads
// ============================================================================

/// Request to create a batch from explicit order ids
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub order_ids: Vec<Uuid>,
    pub max_deviation_km: Option<f64>,
    pub search_radius_km: Option<f64>,
}

/// Request addressing a single batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchIdRequest {
    pub batch_id: Uuid,
}

/// Request to cancel a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBatchRequest {
    pub batch_id: Uuid,
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by operator".to_string()
}

/// Request to record a pickup or delivery outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegUpdateRequest {
    pub batch_id: Uuid,
    pub order_id: Uuid,
    pub status: LegStatus,
}

/// Request to add an order to / remove an order from a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOrderRequest {
    pub batch_id: Uuid,
    pub order_id: Uuid,
}

/// Batch with its membership rows ordered by pickup sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetail {
    pub batch: Batch,
    pub orders: Vec<BatchOrder>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_machine_allowed_transitions() {
        use BatchStatus::*;
        assert!(Planned.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Planned.can_transition_to(Cancelled));
    }

    #[test]
    fn test_state_machine_rejected_transitions() {
        use BatchStatus::*;
        assert!(!Planned.can_transition_to(Completed));
        assert!(!Planned.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Planned));
        assert!(!Active.can_transition_to(Planned));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(BatchStatus::NON_TERMINAL.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn test_leg_status_only_leaves_pending() {
        assert!(LegStatus::Pending.can_transition_to(LegStatus::Completed));
        assert!(LegStatus::Pending.can_transition_to(LegStatus::Skipped));
        assert!(!LegStatus::Pending.can_transition_to(LegStatus::Pending));
        assert!(!LegStatus::Completed.can_transition_to(LegStatus::Failed));
    }

    #[test]
    fn test_batch_number_format() {
        let id = Uuid::parse_str("1a2b3c4d-0000-0000-0000-000000000000").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(batch_number(id, at), "B20261019-1a2b3c4d");
    }

    #[test]
    fn test_cancel_request_default_reason() {
        let json = r#"{"batchId": "123e4567-e89b-12d3-a456-426614174000"}"#;
        let request: CancelBatchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.reason, "cancelled by operator");
    }

    #[test]
    fn test_leg_update_request_deserialize() {
        let json = r#"{
            "batchId": "123e4567-e89b-12d3-a456-426614174000",
            "orderId": "123e4567-e89b-12d3-a456-426614174001",
            "status": "completed"
        }"#;
        let request: LegUpdateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.status, LegStatus::Completed);
    }
}
