//! Batch subjects: creation, lifecycle, leg updates and route edits

use anyhow::Result;
use async_nats::Client;
use tokio::task::JoinSet;

use super::{serve, DispatchEngine};
use crate::types::{BatchIdRequest, BatchOrderRequest, CancelBatchRequest, CreateBatchRequest, LegUpdateRequest};

pub const SUBJECT_CREATE: &str = "dispatch.batch.create";
pub const SUBJECT_GET: &str = "dispatch.batch.get";
pub const SUBJECT_START: &str = "dispatch.batch.start";
pub const SUBJECT_PAUSE: &str = "dispatch.batch.pause";
pub const SUBJECT_RESUME: &str = "dispatch.batch.resume";
pub const SUBJECT_CANCEL: &str = "dispatch.batch.cancel";
pub const SUBJECT_COMPLETE: &str = "dispatch.batch.complete";
pub const SUBJECT_PICKUP: &str = "dispatch.batch.pickup";
pub const SUBJECT_DELIVER: &str = "dispatch.batch.deliver";
pub const SUBJECT_ORDER_ADD: &str = "dispatch.batch.order.add";
pub const SUBJECT_ORDER_REMOVE: &str = "dispatch.batch.order.remove";

pub async fn spawn_handlers(client: &Client, engine: &DispatchEngine, tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_CREATE).await?, move |req: CreateBatchRequest| {
        let e = e.clone();
        async move {
            e.grouping
                .create_optimized_batch(&req.order_ids, req.max_deviation_km, req.search_radius_km)
                .await
        }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_GET).await?, move |req: BatchIdRequest| {
        let e = e.clone();
        async move { e.lifecycle.get_batch(req.batch_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_START).await?, move |req: BatchIdRequest| {
        let e = e.clone();
        async move { e.lifecycle.start_batch(req.batch_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_PAUSE).await?, move |req: BatchIdRequest| {
        let e = e.clone();
        async move { e.lifecycle.pause_batch(req.batch_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_RESUME).await?, move |req: BatchIdRequest| {
        let e = e.clone();
        async move { e.lifecycle.resume_batch(req.batch_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_CANCEL).await?, move |req: CancelBatchRequest| {
        let e = e.clone();
        async move { e.lifecycle.cancel_batch(req.batch_id, &req.reason).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_COMPLETE).await?, move |req: BatchIdRequest| {
        let e = e.clone();
        async move { e.lifecycle.complete_batch(req.batch_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_PICKUP).await?, move |req: LegUpdateRequest| {
        let e = e.clone();
        async move { e.lifecycle.update_pickup(req.batch_id, req.order_id, req.status).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_DELIVER).await?, move |req: LegUpdateRequest| {
        let e = e.clone();
        async move { e.lifecycle.update_delivery(req.batch_id, req.order_id, req.status).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_ORDER_ADD).await?, move |req: BatchOrderRequest| {
        let e = e.clone();
        async move { e.updater.add_order(req.batch_id, req.order_id).await }
    }));

    let e = engine.clone();
    tasks.spawn(serve(client.clone(), client.subscribe(SUBJECT_ORDER_REMOVE).await?, move |req: BatchOrderRequest| {
        let e = e.clone();
        async move { e.updater.remove_order(req.batch_id, req.order_id).await }
    }));

    Ok(())
}
