//! Workload subjects and the periodic rebalance loop

use std::time::Duration;

use anyhow::Result;
use async_nats::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{serve, DispatchEngine};
use crate::types::EmptyPayload;

pub const SUBJECT_REPORT: &str = "dispatch.workload.report";
pub const SUBJECT_REBALANCE: &str = "dispatch.workload.rebalance";

pub async fn spawn_handlers(client: &Client, engine: &DispatchEngine, tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_REPORT).await?, move |_: EmptyPayload| {
        let e = e.clone();
        async move { e.balancer.audit().await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_REBALANCE).await?, move |_: EmptyPayload| {
        let e = e.clone();
        async move { e.balancer.rebalance().await }
    }));

    Ok(())
}

/// Rebalance every `interval_secs` until `shutdown` fires
pub async fn run_periodic(engine: DispatchEngine, interval_secs: u64, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; let the first sweep run before moving batches around
    ticker.tick().await;
    info!(interval_secs, "Periodic rebalancing enabled");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match engine.balancer.rebalance().await {
            Ok(report) if report.applied > 0 => info!(applied = report.applied, "Periodic rebalance moved batches"),
            Ok(_) => {}
            Err(e) => error!("Periodic rebalance failed: {}", e),
        }
    }

    info!("Periodic rebalancing stopped");
    Ok(())
}
