//! Grouping of ready orders into batches
//!
//! `create_optimized_batch` runs the full pipeline for one explicit order
//! set: compatibility, driver selection, sequencing, persistence.
//! `run_sweep` partitions the whole ready pool with a seeded greedy pass and
//! feeds every group through the same pipeline with bounded parallelism.
//! Groups are independent: a failed group is reported and the sweep goes on.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::ports::OrderStore;
use crate::error::DispatchError;
use crate::services::assignment::DriverAssignmentSelector;
use crate::services::compatibility::OrderCompatibilityAnalyzer;
use crate::services::lifecycle::BatchLifecycleManager;
use crate::services::locks::{KeyedLocks, LockKey};
use crate::services::retry::{with_retry, RetryPolicy};
use crate::services::sequencer::RouteSequencer;
use crate::types::{BatchDetail, ErrorDetail, Order};

/// Outcome of one group of a sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupOutcome {
    pub group_index: usize,
    pub order_ids: Vec<Uuid>,
    pub batch_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Not attempted because the sweep was cancelled
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pool_size: usize,
    pub batches_created: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub groups: Vec<GroupOutcome>,
}

pub struct DistanceGroupingEngine {
    orders: Arc<dyn OrderStore>,
    analyzer: Arc<OrderCompatibilityAnalyzer>,
    selector: Arc<DriverAssignmentSelector>,
    sequencer: RouteSequencer,
    lifecycle: Arc<BatchLifecycleManager>,
    locks: KeyedLocks,
    settings: DispatchSettings,
    retry: RetryPolicy,
}

impl DistanceGroupingEngine {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        analyzer: Arc<OrderCompatibilityAnalyzer>,
        selector: Arc<DriverAssignmentSelector>,
        lifecycle: Arc<BatchLifecycleManager>,
        locks: KeyedLocks,
        settings: DispatchSettings,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            orders,
            analyzer,
            selector,
            sequencer: RouteSequencer::new(&settings),
            lifecycle,
            locks,
            settings,
            retry,
        }
    }

    /// Build, assign, sequence and persist one batch from explicit order ids.
    ///
    /// When the chosen driver is claimed by someone else between selection
    /// and persistence, the orders are re-read and the next best driver is
    /// tried, up to the configured conflict retries.
    pub async fn create_optimized_batch(
        &self,
        order_ids: &[Uuid],
        max_deviation_km: Option<f64>,
        search_radius_km: Option<f64>,
    ) -> Result<BatchDetail, DispatchError> {
        self.validate_request(order_ids)?;
        let max_deviation_km = max_deviation_km.unwrap_or(self.settings.max_deviation_km);
        let search_radius_km = search_radius_km.unwrap_or(self.settings.search_radius_km);

        let _held = self.locks.acquire(order_ids.iter().map(|id| LockKey::Order(*id))).await;

        let mut excluded: HashSet<Uuid> = HashSet::new();
        let mut attempts = 0u32;
        loop {
            let (compatibility, orders) = self.analyzer.analyze(order_ids, max_deviation_km).await?;
            let compatibility_score = compatibility.into_result()?;

            let assignment = self.selector.select(&orders, search_radius_km, &excluded).await?;
            let route = self.sequencer.sequence(&orders, Some(assignment.location));
            let metadata = json!({
                "compatibilityScore": compatibility_score,
                "assignmentScore": assignment.score,
                "assignment": assignment.metadata,
            });

            match self
                .lifecycle
                .create_batch(assignment.driver_id, &route, max_deviation_km, metadata)
                .await
            {
                Ok(detail) => return Ok(detail),
                Err(e) if e.is_conflict() && attempts < self.settings.conflict_max_retries => {
                    attempts += 1;
                    warn!(
                        driver_id = %assignment.driver_id,
                        attempts,
                        "Claim conflict while creating batch, retrying: {}",
                        e
                    );
                    excluded.insert(assignment.driver_id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Partition the ready pool and batch every group
    pub async fn run_sweep(&self, sweep_id: Uuid, cancel: CancellationToken) -> Result<SweepReport, DispatchError> {
        let started_at = Utc::now();
        let pool = with_retry(&self.retry, "list_ready_unassigned", || {
            self.orders.list_ready_unassigned(self.settings.sweep_pool_limit)
        })
        .await?;
        let groups = self.group_orders(&pool, self.settings.max_orders_per_batch, self.settings.max_deviation_km);
        info!(
            sweep_id = %sweep_id,
            pool = pool.len(),
            groups = groups.len(),
            "Sweep started"
        );

        let mut outcomes: Vec<GroupOutcome> = stream::iter(groups.into_iter().enumerate())
            .map(|(index, group)| {
                let cancel = cancel.clone();
                async move { self.process_group(index, group, &cancel).await }
            })
            .buffer_unordered(self.settings.sweep_parallelism)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.group_index);

        let batches_created = outcomes.iter().filter(|o| o.batch_id.is_some()).count();
        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        let skipped = outcomes.iter().filter(|o| o.skipped).count();
        let report = SweepReport {
            sweep_id,
            started_at,
            finished_at: Utc::now(),
            pool_size: pool.len(),
            batches_created,
            failed,
            skipped,
            cancelled: cancel.is_cancelled(),
            groups: outcomes,
        };
        info!(
            sweep_id = %sweep_id,
            created = batches_created,
            failed,
            skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    async fn process_group(&self, index: usize, group: Vec<Order>, cancel: &CancellationToken) -> GroupOutcome {
        let order_ids: Vec<Uuid> = group.iter().map(|o| o.id).collect();
        let mut outcome = GroupOutcome {
            group_index: index,
            order_ids: order_ids.clone(),
            batch_id: None,
            driver_id: None,
            error: None,
            skipped: false,
        };
        if cancel.is_cancelled() {
            outcome.skipped = true;
            return outcome;
        }

        match self.create_optimized_batch(&order_ids, None, None).await {
            Ok(detail) => {
                outcome.batch_id = Some(detail.batch.id);
                outcome.driver_id = Some(detail.batch.driver_id);
            }
            Err(e) => {
                debug!(group = index, "Group not batched: {}", e);
                outcome.error = Some(ErrorDetail::from(&e));
            }
        }
        outcome
    }

    /// Seeded greedy partition of `pool`.
    ///
    /// Orders are taken oldest first. The oldest remaining order seeds a
    /// group; the rest of the pool is scanned in order and an order joins
    /// when the grown group still evaluates compatible, which implies it is
    /// pairwise compatible with every member. Deterministic for a given pool.
    pub fn group_orders(&self, pool: &[Order], max_per_group: usize, max_deviation_km: f64) -> Vec<Vec<Order>> {
        let mut remaining: Vec<Order> = pool.iter().filter(|o| o.is_unassigned_ready()).cloned().collect();
        remaining.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut groups = Vec::new();
        while !remaining.is_empty() {
            let mut group = vec![remaining.remove(0)];
            let mut i = 0;
            while i < remaining.len() && group.len() < max_per_group {
                group.push(remaining[i].clone());
                if self.analyzer.evaluate(&group, max_deviation_km).is_compatible {
                    remaining.remove(i);
                } else {
                    group.pop();
                    i += 1;
                }
            }
            groups.push(group);
        }
        groups
    }

    fn validate_request(&self, order_ids: &[Uuid]) -> Result<(), DispatchError> {
        if order_ids.is_empty() {
            return Err(DispatchError::Validation("At least one order id is required".to_string()));
        }
        if order_ids.len() > self.settings.max_orders_per_batch {
            return Err(DispatchError::Validation(format!(
                "A batch holds at most {} orders, got {}",
                self.settings.max_orders_per_batch,
                order_ids.len()
            )));
        }
        let unique: HashSet<&Uuid> = order_ids.iter().collect();
        if unique.len() != order_ids.len() {
            return Err(DispatchError::Validation("Order ids must be unique".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::fixtures::{driver, order};
    use crate::db::memory::InMemoryStore;
    use crate::services::events::RecordingEventPublisher;
    use crate::types::{BatchEventType, BatchStatus, OrderStatus};
    use chrono::Duration;

    struct Harness {
        store: InMemoryStore,
        events: Arc<RecordingEventPublisher>,
        engine: DistanceGroupingEngine,
    }

    fn harness() -> Harness {
        harness_with(DispatchSettings::default())
    }

    fn harness_with(settings: DispatchSettings) -> Harness {
        let store = InMemoryStore::new();
        let events = Arc::new(RecordingEventPublisher::new());
        let locks = KeyedLocks::new();
        let shared = Arc::new(store.clone());
        let analyzer = Arc::new(OrderCompatibilityAnalyzer::new(shared.clone(), settings.clone()));
        let selector = Arc::new(DriverAssignmentSelector::new(shared.clone(), settings.clone()));
        let lifecycle = Arc::new(BatchLifecycleManager::new(
            shared.clone(),
            shared.clone(),
            events.clone(),
            locks.clone(),
            settings.clone(),
        ));
        let engine = DistanceGroupingEngine::new(shared, analyzer, selector, lifecycle, locks, settings);
        Harness { store, events, engine }
    }

    #[tokio::test]
    async fn test_create_optimized_batch_for_nearby_orders() {
        let h = harness();
        let d = driver(3.10, 101.60);
        h.store.insert_driver(d.clone());
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let o2 = order(v1, 3.105, 101.605, 5);
        h.store.insert_order(o1.clone());
        h.store.insert_order(o2.clone());

        let detail = h.engine.create_optimized_batch(&[o1.id, o2.id], None, None).await.unwrap();

        assert_eq!(detail.batch.driver_id, d.id);
        assert_eq!(detail.batch.status, BatchStatus::Planned);
        assert_eq!(detail.orders.len(), 2);
        let mut seqs: Vec<i32> = detail.orders.iter().map(|r| r.pickup_sequence).collect();
        seqs.sort();
        assert_eq!(seqs, vec![1, 2]);
        assert!(detail.batch.metadata["compatibilityScore"].as_f64().unwrap() >= 0.7);
        assert_eq!(h.store.order(o1.id).unwrap().assigned_driver_id, Some(d.id));
        assert_eq!(h.events.of_type(BatchEventType::BatchCreated).len(), 1);
    }

    #[tokio::test]
    async fn test_far_apart_orders_are_rejected() {
        let h = harness();
        h.store.insert_driver(driver(3.10, 101.60));
        let v1 = Uuid::new_v4();
        let o1 = order(v1, 3.10, 101.60, 0);
        let o3 = order(v1, 3.30, 101.80, 0);
        h.store.insert_order(o1.clone());
        h.store.insert_order(o3.clone());

        let err = h.engine.create_optimized_batch(&[o1.id, o3.id], None, None).await.unwrap_err();
        match err {
            DispatchError::Incompatible { reason, .. } => assert!(reason.contains("km"), "{}", reason),
            other => panic!("expected incompatibility, got {:?}", other),
        }
        assert!(h.store.batches().is_empty());
    }

    #[tokio::test]
    async fn test_only_nearby_driver_busy_yields_no_candidate() {
        let h = harness();
        let d1 = driver(3.10, 101.60);
        h.store.insert_driver(d1.clone());
        let v1 = Uuid::new_v4();
        let first = order(v1, 3.10, 101.60, 0);
        let second = order(v1, 3.101, 101.601, 1);
        h.store.insert_order(first.clone());
        h.store.insert_order(second.clone());

        let detail = h.engine.create_optimized_batch(&[first.id], None, None).await.unwrap();
        h.engine.lifecycle.start_batch(detail.batch.id).await.unwrap();

        let err = h.engine.create_optimized_batch(&[second.id], None, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoCandidate(_)));
        assert!(h.store.order(second.id).unwrap().is_unassigned_ready());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let h = harness();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        assert!(matches!(
            h.engine.create_optimized_batch(&[], None, None).await,
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            h.engine.create_optimized_batch(&ids, None, None).await,
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            h.engine.create_optimized_batch(&[ids[0], ids[0]], None, None).await,
            Err(DispatchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let h = harness();
        h.store.insert_driver(driver(3.10, 101.60));
        let o1 = order(Uuid::new_v4(), 3.10, 101.60, 0);
        h.store.insert_order(o1.clone());

        h.store.inject_failures(1);
        let detail = h.engine.create_optimized_batch(&[o1.id], None, None).await.unwrap();
        assert_eq!(detail.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_group_orders_is_seeded_greedy() {
        let h = harness();
        let v1 = Uuid::new_v4();
        let a = order(v1, 3.10, 101.60, 0);
        let far = order(v1, 3.30, 101.80, 1);
        let b = order(v1, 3.101, 101.601, 2);
        let c = order(v1, 3.102, 101.602, 3);
        let d = order(v1, 3.103, 101.603, 4);

        // Input order does not matter, creation time does
        let pool = vec![d.clone(), far.clone(), c.clone(), a.clone(), b.clone()];
        let groups = h.engine.group_orders(&pool, 3, 5.0);

        let ids: Vec<Vec<Uuid>> = groups.iter().map(|g| g.iter().map(|o| o.id).collect()).collect();
        assert_eq!(ids, vec![vec![a.id, b.id, c.id], vec![far.id], vec![d.id]]);
    }

    #[tokio::test]
    async fn test_group_orders_respects_time_window() {
        let h = harness();
        let v1 = Uuid::new_v4();
        let a = order(v1, 3.10, 101.60, 0);
        let mut late = order(v1, 3.101, 101.601, 1);
        late.estimated_delivery_time = a.estimated_delivery_time + Duration::minutes(90);

        let groups = h.engine.group_orders(&[a, late], 3, 5.0);
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_batches_groups_and_collects_failures() {
        let h = harness();
        // One driver near the first cluster only
        let d = driver(3.10, 101.60);
        h.store.insert_driver(d.clone());
        let v1 = Uuid::new_v4();
        let near1 = order(v1, 3.10, 101.60, 0);
        let near2 = order(v1, 3.101, 101.601, 1);
        let far = order(v1, 3.60, 102.10, 2);
        for o in [&near1, &near2, &far] {
            h.store.insert_order(o.clone());
        }

        let report = h.engine.run_sweep(Uuid::new_v4(), CancellationToken::new()).await.unwrap();

        assert_eq!(report.pool_size, 3);
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.batches_created, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.cancelled);
        assert_eq!(report.groups[0].driver_id, Some(d.id));
        assert_eq!(report.groups[1].error.as_ref().unwrap().code, "NO_CANDIDATE");
        // The failed group stays in the pool
        assert!(h.store.order(far.id).unwrap().is_unassigned_ready());
        assert_eq!(h.store.order(near2.id).unwrap().status, OrderStatus::Ready);
        assert_eq!(h.store.order(near2.id).unwrap().assigned_driver_id, Some(d.id));
    }

    #[tokio::test]
    async fn test_cancelled_sweep_skips_remaining_groups() {
        let h = harness();
        h.store.insert_driver(driver(3.10, 101.60));
        h.store.insert_order(order(Uuid::new_v4(), 3.10, 101.60, 0));
        h.store.insert_order(order(Uuid::new_v4(), 3.60, 102.10, 1));

        let token = CancellationToken::new();
        token.cancel();
        let report = h.engine.run_sweep(Uuid::new_v4(), token).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.batches_created, 0);
        assert!(h.store.batches().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_sweep_never_double_books_a_driver() {
        let mut settings = DispatchSettings::default();
        settings.sweep_parallelism = 4;
        let h = harness_with(settings);
        // Two drivers, four far-apart clusters within their radius
        h.store.insert_driver(driver(3.10, 101.60));
        h.store.insert_driver(driver(3.11, 101.61));
        for (i, (lat, lng)) in [(3.10, 101.60), (3.16, 101.60), (3.10, 101.66), (3.16, 101.66)]
            .into_iter()
            .enumerate()
        {
            h.store.insert_order(order(Uuid::new_v4(), lat, lng, i as i64));
        }

        let report = h.engine.run_sweep(Uuid::new_v4(), CancellationToken::new()).await.unwrap();

        assert_eq!(report.groups.len(), 4);
        assert_eq!(report.batches_created, 2);
        let mut drivers: Vec<Uuid> = h.store.batches().iter().map(|b| b.driver_id).collect();
        drivers.sort();
        drivers.dedup();
        assert_eq!(drivers.len(), 2);
    }
}
