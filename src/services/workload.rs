//! Driver workload auditing and rebalancing
//!
//! Load is counted from non-terminal batches: orders whose delivery is still
//! pending. Online drivers without a batch take part with zero load. Drivers
//! above `overload_factor` times the fleet average are overloaded, drivers
//! below `underload_factor` times the average are underloaded.
//!
//! Only planned batches move. A started trip stays with its driver.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::{BatchStore, DriverStore, OrderStore};
use crate::error::DispatchError;
use crate::services::events::{emit, EventPublisher};
use crate::services::locks::{KeyedLocks, LockKey};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::sequencer::{stop_order, RouteSequencer};
use crate::types::{BatchEvent, BatchEventType, BatchOrder, BatchStatus, Coordinates, LegStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLoad {
    pub driver_id: Uuid,
    pub batch_count: usize,
    pub active_orders: usize,
    pub estimated_duration_minutes: i64,
    /// Planned batches that could still be handed to someone else
    pub planned_batch_ids: Vec<Uuid>,
}

impl DriverLoad {
    fn empty(driver_id: Uuid) -> Self {
        Self {
            driver_id,
            batch_count: 0,
            active_orders: 0,
            estimated_duration_minutes: 0,
            planned_batch_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReassignmentProposal {
    pub batch_id: Uuid,
    pub from_driver_id: Uuid,
    pub to_driver_id: Uuid,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReport {
    pub generated_at: DateTime<Utc>,
    pub fleet_average_orders: f64,
    pub drivers: Vec<DriverLoad>,
    pub overloaded: Vec<Uuid>,
    pub underloaded: Vec<Uuid>,
    pub proposals: Vec<ReassignmentProposal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReassignmentOutcome {
    pub proposal: ReassignmentProposal,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    pub audit: WorkloadReport,
    pub outcomes: Vec<ReassignmentOutcome>,
    pub applied: usize,
}

pub struct WorkloadBalancer {
    batches: Arc<dyn BatchStore>,
    orders: Arc<dyn OrderStore>,
    drivers: Arc<dyn DriverStore>,
    sequencer: RouteSequencer,
    events: Arc<dyn EventPublisher>,
    locks: KeyedLocks,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl WorkloadBalancer {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        orders: Arc<dyn OrderStore>,
        drivers: Arc<dyn DriverStore>,
        events: Arc<dyn EventPublisher>,
        locks: KeyedLocks,
        settings: DispatchSettings,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            batches,
            orders,
            drivers,
            sequencer: RouteSequencer::new(&settings),
            events,
            locks,
            settings,
            retry,
        }
    }

    /// Per-driver aggregates and reassignment proposals, without side effects
    pub async fn audit(&self) -> Result<WorkloadReport, DispatchError> {
        let batches = with_retry(&self.retry, "list_batches", || {
            self.batches.list_batches(&BatchStatus::NON_TERMINAL)
        })
        .await?;
        let online = with_retry(&self.retry, "list_available_drivers", || {
            self.drivers.list_available_drivers()
        })
        .await?;

        // BTreeMap keeps the report ordered by driver id
        let mut loads: BTreeMap<Uuid, DriverLoad> = BTreeMap::new();
        let mut pending_by_batch: HashMap<Uuid, usize> = HashMap::new();
        for driver in &online {
            loads.insert(driver.id, DriverLoad::empty(driver.id));
        }
        for batch in &batches {
            let rows = with_retry(&self.retry, "get_batch_orders", || {
                self.batches.get_batch_orders(batch.id)
            })
            .await?;
            let load = loads
                .entry(batch.driver_id)
                .or_insert_with(|| DriverLoad::empty(batch.driver_id));
            let pending = rows
                .iter()
                .filter(|r| r.delivery_status == LegStatus::Pending)
                .count();
            pending_by_batch.insert(batch.id, pending);
            load.batch_count += 1;
            load.active_orders += pending;
            load.estimated_duration_minutes += batch.estimated_duration_minutes as i64;
            if batch.status == BatchStatus::Planned {
                load.planned_batch_ids.push(batch.id);
            }
        }

        let drivers: Vec<DriverLoad> = loads.into_values().collect();
        let online_ids: HashSet<Uuid> = online.iter().map(|d| d.id).collect();
        Ok(self.plan(drivers, &pending_by_batch, &online_ids))
    }

    fn plan(
        &self,
        drivers: Vec<DriverLoad>,
        pending_by_batch: &HashMap<Uuid, usize>,
        online: &HashSet<Uuid>,
    ) -> WorkloadReport {
        let total: usize = drivers.iter().map(|d| d.active_orders).sum();
        let average = if drivers.is_empty() {
            0.0
        } else {
            total as f64 / drivers.len() as f64
        };

        let mut overloaded: Vec<&DriverLoad> = drivers
            .iter()
            .filter(|d| average > 0.0 && d.active_orders as f64 > self.settings.overload_factor * average)
            .collect();
        overloaded.sort_by(|a, b| b.active_orders.cmp(&a.active_orders).then(a.driver_id.cmp(&b.driver_id)));

        let mut underloaded: Vec<&DriverLoad> = drivers
            .iter()
            .filter(|d| average > 0.0 && (d.active_orders as f64) < self.settings.underload_factor * average)
            .collect();
        underloaded.sort_by(|a, b| a.active_orders.cmp(&b.active_orders).then(a.driver_id.cmp(&b.driver_id)));

        // A driver holds one batch at a time, so only idle online drivers can take one
        let mut targets = underloaded
            .iter()
            .filter(|d| d.batch_count == 0 && online.contains(&d.driver_id))
            .map(|d| d.driver_id);

        let mut proposals = Vec::new();
        'sources: for source in &overloaded {
            for batch_id in &source.planned_batch_ids {
                let Some(target) = targets.next() else {
                    break 'sources;
                };
                let order_count = pending_by_batch.get(batch_id).copied().unwrap_or(0);
                proposals.push(ReassignmentProposal {
                    batch_id: *batch_id,
                    from_driver_id: source.driver_id,
                    to_driver_id: target,
                    order_count,
                });
            }
        }

        WorkloadReport {
            generated_at: Utc::now(),
            fleet_average_orders: average,
            overloaded: overloaded.iter().map(|d| d.driver_id).collect(),
            underloaded: underloaded.iter().map(|d| d.driver_id).collect(),
            proposals,
            drivers,
        }
    }

    /// Audit, then execute every proposal. A proposal that no longer holds
    /// is skipped with a reason; the others still run.
    pub async fn rebalance(&self) -> Result<RebalanceReport, DispatchError> {
        let audit = self.audit().await?;
        let mut outcomes = Vec::with_capacity(audit.proposals.len());
        for proposal in &audit.proposals {
            let outcome = match self.execute(proposal).await {
                Ok(None) => ReassignmentOutcome {
                    proposal: proposal.clone(),
                    applied: true,
                    skipped_reason: None,
                },
                Ok(Some(reason)) => ReassignmentOutcome {
                    proposal: proposal.clone(),
                    applied: false,
                    skipped_reason: Some(reason),
                },
                Err(e) => ReassignmentOutcome {
                    proposal: proposal.clone(),
                    applied: false,
                    skipped_reason: Some(e.to_string()),
                },
            };
            if let Some(reason) = &outcome.skipped_reason {
                warn!(batch_id = %proposal.batch_id, "Reassignment skipped: {}", reason);
            }
            outcomes.push(outcome);
        }

        let applied = outcomes.iter().filter(|o| o.applied).count();
        info!(
            proposals = audit.proposals.len(),
            applied,
            average = audit.fleet_average_orders,
            "Workload rebalanced"
        );
        Ok(RebalanceReport {
            audit,
            outcomes,
            applied,
        })
    }

    /// Move one batch. `Ok(Some(reason))` means the move was skipped.
    pub async fn execute(&self, proposal: &ReassignmentProposal) -> Result<Option<String>, DispatchError> {
        let (batch_id, from, to) = (proposal.batch_id, proposal.from_driver_id, proposal.to_driver_id);
        let _held = self
            .locks
            .acquire([LockKey::Batch(batch_id), LockKey::Driver(from), LockKey::Driver(to)])
            .await;

        let target = with_retry(&self.retry, "get_driver", || self.drivers.get_driver(to)).await?;
        let Some(target) = target else {
            return Ok(Some(format!("Driver {} no longer exists", to)));
        };
        if !target.is_available() {
            return Ok(Some(format!("Driver {} went offline", to)));
        }
        if target.holds_batch() {
            return Ok(Some(format!("Driver {} already holds a batch", to)));
        }
        if target.workload_count >= self.settings.max_driver_workload {
            return Ok(Some(format!(
                "Driver {} is at capacity ({} of {})",
                to, target.workload_count, self.settings.max_driver_workload
            )));
        }

        let mut rows = with_retry(&self.retry, "get_batch_orders", || {
            self.batches.get_batch_orders(batch_id)
        })
        .await?;
        rows.sort_by_key(|r| r.pickup_sequence);

        let claimed = with_retry(&self.retry, "set_current_batch", || {
            self.drivers.set_current_batch(to, None, Some(batch_id))
        })
        .await?;
        if !claimed {
            return Ok(Some(format!("Driver {} was claimed concurrently", to)));
        }

        let moved = match with_retry(&self.retry, "reassign_batch", || {
            self.batches.reassign_batch(batch_id, from, to)
        })
        .await
        {
            Ok(moved) => moved,
            Err(e) => {
                self.release_claim(to, batch_id).await;
                return Err(e);
            }
        };
        if !moved {
            self.release_claim(to, batch_id).await;
            return Ok(Some(format!("Batch {} is no longer planned for driver {}", batch_id, from)));
        }

        let released = with_retry(&self.retry, "set_current_batch", || {
            self.drivers.set_current_batch(from, Some(batch_id), None)
        })
        .await?;
        if !released {
            warn!(driver_id = %from, batch_id = %batch_id, "Source driver no longer referenced the batch");
        }

        if let Err(e) = self.remeasure(batch_id, &rows, target.current_location).await {
            warn!(batch_id = %batch_id, "Failed to re-measure reassigned batch: {}", e);
        }

        info!(batch_id = %batch_id, from = %from, to = %to, "Batch reassigned");
        let order_ids = rows.iter().map(|r| r.order_id).collect();
        emit(
            self.events.as_ref(),
            BatchEvent::new(BatchEventType::WorkloadRebalanced, batch_id, order_ids)
                .with_driver(to)
                .with_details(json!({
                    "fromDriverId": from,
                    "toDriverId": to,
                    "orderCount": proposal.order_count,
                })),
        )
        .await;
        Ok(None)
    }

    /// Route metrics from the new driver's position, stops in stored order
    async fn remeasure(
        &self,
        batch_id: Uuid,
        rows: &[BatchOrder],
        origin: Option<Coordinates>,
    ) -> Result<(), DispatchError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.order_id).collect();
        let orders = with_retry(&self.retry, "get_orders", || self.orders.get_orders(&ids)).await?;
        let (pickups, deliveries) = stop_order(rows, orders)
            .ok_or_else(|| DispatchError::Conflict(format!("Members of batch {} changed while moving", batch_id)))?;
        let metrics = self.sequencer.measure(&pickups, &deliveries, origin).metrics();
        with_retry(&self.retry, "update_metrics", || {
            self.batches.update_metrics(batch_id, &metrics)
        })
        .await
    }

    async fn release_claim(&self, driver_id: Uuid, batch_id: Uuid) {
        let result = with_retry(&self.retry, "set_current_batch", || {
            self.drivers.set_current_batch(driver_id, Some(batch_id), None)
        })
        .await;
        if let Err(e) = result {
            warn!(driver_id = %driver_id, batch_id = %batch_id, "Failed to release driver claim: {}", e);
        }
    }
}
