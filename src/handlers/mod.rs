//! NATS message handlers

pub mod batch;
pub mod ping;
pub mod sweep;
pub mod workload;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DispatchSettings};
use crate::db::ports::{BatchStore, DriverStore, OrderStore};
use crate::error::DispatchError;
use crate::services::assignment::DriverAssignmentSelector;
use crate::services::cancellation::CancellationRegistry;
use crate::services::compatibility::OrderCompatibilityAnalyzer;
use crate::services::events::EventPublisher;
use crate::services::grouping::DistanceGroupingEngine;
use crate::services::lifecycle::BatchLifecycleManager;
use crate::services::locks::KeyedLocks;
use crate::services::route_updater::DynamicRouteUpdater;
use crate::services::workload::WorkloadBalancer;
use crate::types::{ErrorResponse, Request, SuccessResponse};

/// Every engine component, wired to one store and one event publisher
#[derive(Clone)]
pub struct DispatchEngine {
    pub lifecycle: Arc<BatchLifecycleManager>,
    pub grouping: Arc<DistanceGroupingEngine>,
    pub updater: Arc<DynamicRouteUpdater>,
    pub balancer: Arc<WorkloadBalancer>,
    pub sweeps: CancellationRegistry,
}

impl DispatchEngine {
    pub fn new<S>(store: Arc<S>, events: Arc<dyn EventPublisher>, settings: DispatchSettings) -> Self
    where
        S: OrderStore + DriverStore + BatchStore + 'static,
    {
        let orders: Arc<dyn OrderStore> = store.clone();
        let drivers: Arc<dyn DriverStore> = store.clone();
        let batches: Arc<dyn BatchStore> = store;
        // One lock table for the whole process
        let locks = KeyedLocks::new();

        let analyzer = Arc::new(OrderCompatibilityAnalyzer::new(orders.clone(), settings.clone()));
        let selector = Arc::new(DriverAssignmentSelector::new(drivers.clone(), settings.clone()));
        let lifecycle = Arc::new(BatchLifecycleManager::new(
            batches.clone(),
            orders.clone(),
            events.clone(),
            locks.clone(),
            settings.clone(),
        ));
        let grouping = Arc::new(DistanceGroupingEngine::new(
            orders.clone(),
            analyzer.clone(),
            selector,
            lifecycle.clone(),
            locks.clone(),
            settings.clone(),
        ));
        let updater = Arc::new(DynamicRouteUpdater::new(
            batches.clone(),
            orders.clone(),
            drivers.clone(),
            analyzer,
            lifecycle.clone(),
            events.clone(),
            locks.clone(),
            settings.clone(),
        ));
        let balancer = Arc::new(WorkloadBalancer::new(batches, orders, drivers, events, locks, settings));

        Self {
            lifecycle,
            grouping,
            updater,
            balancer,
            sweeps: CancellationRegistry::new(),
        }
    }
}

// ============================================================================
// Request/reply plumbing
// ============================================================================

/// Reply loop shared by every enveloped subject: parse `Request<T>`, run the
/// operation, answer with `SuccessResponse<R>` or `ErrorResponse`.
pub async fn serve<T, R, F, Fut>(client: Client, mut subscriber: Subscriber, operation: F) -> Result<()>
where
    T: DeserializeOwned + Send,
    R: Serialize + Send,
    F: Fn(T) -> Fut + Send,
    Fut: Future<Output = Result<R, DispatchError>> + Send,
{
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => {
                warn!(subject = %msg.subject, "Message without reply subject");
                continue;
            }
        };

        let request: Request<T> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!(subject = %msg.subject, "Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match operation(request.payload).await {
            Ok(payload) => {
                let success = SuccessResponse::new(request.id, payload);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                warn!(subject = %msg.subject, code = e.code(), "Request failed: {}", e);
                let error = ErrorResponse::from_error(request.id, &e);
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Subscribe to every subject and run until a handler dies or `shutdown` fires
pub async fn start_handlers(
    client: Client,
    engine: DispatchEngine,
    config: &Config,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting message handlers...");

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    tasks.spawn(ping::handle_ping(
        client.clone(),
        client.subscribe("dispatch.ping").await?,
        engine.clone(),
    ));
    batch::spawn_handlers(&client, &engine, &mut tasks).await?;
    sweep::spawn_handlers(&client, &engine, &mut tasks).await?;
    workload::spawn_handlers(&client, &engine, &mut tasks).await?;

    if config.sweep_interval_secs > 0 {
        tasks.spawn(sweep::run_periodic(
            engine.clone(),
            config.sweep_interval_secs,
            shutdown.clone(),
        ));
    }
    if config.rebalance_interval_secs > 0 {
        tasks.spawn(workload::run_periodic(
            engine.clone(),
            config.rebalance_interval_secs,
            shutdown.clone(),
        ));
    }

    info!(tasks = tasks.len(), "All handlers started");

    tokio::select! {
        Some(result) = tasks.join_next() => {
            error!("Handler finished unexpectedly: {:?}", result);
        }
        _ = shutdown.cancelled() => {
            let cancelled = engine.sweeps.cancel_all();
            info!(cancelled_sweeps = cancelled, "Shutting down handlers");
        }
    }

    tasks.shutdown().await;
    Ok(())
}
