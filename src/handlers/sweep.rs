//! Grouping sweep subjects and the periodic sweep loop

use std::time::Duration;

use anyhow::Result;
use async_nats::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::{serve, DispatchEngine};
use crate::error::DispatchError;
use crate::services::grouping::SweepReport;

pub const SUBJECT_RUN: &str = "dispatch.sweep.run";
pub const SUBJECT_CANCEL: &str = "dispatch.sweep.cancel";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSweepRequest {
    /// Caller-chosen id so the sweep can be cancelled while it runs
    #[serde(default)]
    pub sweep_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSweepRequest {
    /// Omit to cancel every running sweep
    #[serde(default)]
    pub sweep_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSweepResponse {
    pub cancelled: usize,
}

/// One grouping pass registered under `sweep_id`
pub async fn run_sweep(engine: &DispatchEngine, sweep_id: Uuid) -> Result<SweepReport, DispatchError> {
    let guard = engine.sweeps.register(sweep_id);
    engine.grouping.run_sweep(guard.sweep_id(), guard.token()).await
}

pub fn cancel_sweep(engine: &DispatchEngine, request: &CancelSweepRequest) -> CancelSweepResponse {
    let cancelled = match request.sweep_id {
        Some(id) => usize::from(engine.sweeps.cancel(&id)),
        None => engine.sweeps.cancel_all(),
    };
    info!(cancelled, "Sweep cancellation requested");
    CancelSweepResponse { cancelled }
}

pub async fn spawn_handlers(client: &Client, engine: &DispatchEngine, tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    // Runs concurrently with the run subject so a long sweep can be stopped
    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_CANCEL).await?, move |req: CancelSweepRequest| {
        let response = cancel_sweep(&e, &req);
        async move { Ok::<_, DispatchError>(response) }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_RUN).await?, move |req: RunSweepRequest| {
        let e = e.clone();
        async move { run_sweep(&e, req.sweep_id.unwrap_or_else(Uuid::new_v4)).await }
    }));

    Ok(())
}

/// Sweep the ready pool every `interval_secs` until `shutdown` fires
pub async fn run_periodic(engine: DispatchEngine, interval_secs: u64, shutdown: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_secs, "Periodic sweeps enabled");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match run_sweep(&engine, Uuid::new_v4()).await {
            Ok(report) if report.pool_size > 0 => info!(
                sweep_id = %report.sweep_id,
                created = report.batches_created,
                failed = report.failed,
                "Periodic sweep done"
            ),
            Ok(_) => {}
            Err(e) => error!("Periodic sweep failed: {}", e),
        }
    }

    info!("Periodic sweeps stopped");
    Ok(())
}
