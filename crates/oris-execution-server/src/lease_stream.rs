//! C5 Lease Stream Service: `Pull` (server-streaming, NDJSON chunked body)
//! plus the unary `Ack`/`Complete`/`Fail` callbacks (spec.md §4.5, §6).
//!
//! gRPC has no footprint anywhere in the retrieved corpus; axum chunked
//! streaming composes with the teacher's existing `execution-server` axum
//! feature, so the wire framing here is newline-delimited JSON over a
//! regular HTTP response body (SPEC_FULL §5).

use std::collections::HashSet;
use std::convert::Infallible;

use async_stream::stream;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{get, post};
use oris_kernel::{NodeId, RunFilter, RunId, RunPatch, RunStatus};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;
use crate::wire::{
    AckRequest, AckResponse, CompleteRequest, CompleteResponse, FailRequest, FailResponse, LeaseWire,
    StreamFrame,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pull", get(pull))
        .route("/ack", post(ack))
        .route("/complete", post(complete))
        .route("/fail", post(fail))
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub node_id: String,
    #[serde(default = "default_max_leases")]
    pub max_leases: usize,
}

fn default_max_leases() -> usize {
    1
}

/// Streams leases assigned to `node_id` as NDJSON frames. Idle between
/// scheduling cycles; polls at `config.pull_poll_interval` (spec.md §4.5:
/// "the server polls pending runs at a bounded cadence"). Respects
/// `max_leases` as an in-flight cap by tracking which emitted run ids are
/// still non-terminal.
#[tracing::instrument(skip(state, params), fields(node_id = %params.node_id, max_leases = params.max_leases))]
async fn pull(State(state): State<AppState>, Query(params): Query<PullParams>) -> Response {
    let node_id = NodeId::from(params.node_id.clone());
    let max_leases = params.max_leases.max(1);
    let mut interval = tokio::time::interval(state.config.pull_poll_interval);
    let mut outstanding: HashSet<RunId> = HashSet::new();

    let body = stream! {
        loop {
            interval.tick().await;

            // Drop outstanding entries whose run left assignment to this
            // node (completed, failed, cancelled, or reassigned elsewhere)
            // so `max_leases` backpressure frees up. A run that left because
            // it was cancelled out from under the node gets one Cancel frame
            // first, so the node can preempt its executor (spec.md §9).
            let mut still_outstanding = HashSet::new();
            for run_id in outstanding.drain() {
                match state.run_store.get_run(&run_id).await {
                    Ok(Some(run))
                        if run.status.has_active_lease() && run.assigned_node_id.as_ref() == Some(&node_id) =>
                    {
                        still_outstanding.insert(run_id);
                    }
                    Ok(Some(run)) if run.cancellation_requested => {
                        let frame = StreamFrame::Cancel { run_id: run_id.as_str().to_string() };
                        match serde_json::to_vec(&frame) {
                            Ok(mut line) => {
                                line.push(b'\n');
                                yield Ok::<Bytes, Infallible>(Bytes::from(line));
                            }
                            Err(e) => {
                                tracing::error!(run_id = %run_id, error = %e, "pull: failed to serialize cancel frame");
                            }
                        }
                    }
                    _ => {}
                }
            }
            outstanding = still_outstanding;

            if outstanding.len() >= max_leases {
                continue;
            }

            let assigned = match state
                .run_store
                .list_runs(&RunFilter {
                    status: Some(RunStatus::Assigned),
                    node_id: Some(node_id.clone()),
                    agent_id: None,
                })
                .await
            {
                Ok(runs) => runs,
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "pull: run store read failed");
                    continue;
                }
            };

            for run in assigned {
                if outstanding.len() >= max_leases {
                    break;
                }
                if outstanding.contains(&run.id) {
                    continue;
                }
                let lease = match state.lease_registry.get_lease(&run.id).await {
                    Ok(Some(lease)) if lease.holder_node_id == node_id => lease,
                    _ => continue,
                };
                outstanding.insert(run.id.clone());
                let frame = StreamFrame::Lease(LeaseWire::from_run_and_lease(&run, &lease));
                match serde_json::to_vec(&frame) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        yield Ok::<Bytes, Infallible>(Bytes::from(line));
                    }
                    Err(e) => {
                        tracing::error!(run_id = %run.id, error = %e, "pull: failed to serialize lease");
                    }
                }
            }
        }
    };

    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body))
        .expect("static response parts always build")
}

/// Diagnostic only (spec.md §4.5): "not required for correctness", so this
/// just records that the node observed the lease rather than gating
/// anything on it. The lease store is keyed by run id, not lease id, so
/// there is deliberately no ownership lookup here.
async fn ack(State(_state): State<AppState>, Json(req): Json<AckRequest>) -> Json<AckResponse> {
    tracing::debug!(
        lease_id = %req.lease_id,
        node_id = %req.node_id,
        client_ts = req.timestamp_ms,
        "lease ack"
    );
    Json(AckResponse { success: true, message: None })
}

#[tracing::instrument(skip(state, req), fields(run_id = %req.run_id, node_id = %req.node_id, lease_id = %req.lease_id))]
async fn complete(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let run_id = RunId::from(req.run_id.clone());
    let node_id = NodeId::from(req.node_id.clone());

    let Some(run) = state.run_store.get_run(&run_id).await? else {
        return Ok(Json(CompleteResponse { success: false, message: Some("run not found".into()) }));
    };
    if run.assigned_node_id.as_ref() != Some(&node_id) {
        tracing::warn!(run_id = %req.run_id, node_id = %req.node_id, "complete rejected: node mismatch");
        return Ok(Json(CompleteResponse { success: false, message: Some("node does not hold this run".into()) }));
    }

    let patch = RunPatch {
        timings: Some(req.timings.into()),
        costs: Some(req.costs.into()),
        ..Default::default()
    };
    match state
        .run_store
        .transition_run(&run_id, &[RunStatus::Assigned, RunStatus::Running], RunStatus::Completed, patch)
        .await
    {
        Ok(completed) => {
            state.lease_registry.release_lease(&run_id).await?;
            if let Some(ms) = completed.timings.duration_ms {
                metrics::histogram!("run_duration_ms").record(ms as f64);
            }
            metrics::counter!("runs_completed_total").increment(1);
            Ok(Json(CompleteResponse { success: true, message: None }))
        }
        Err(e) if e.kind() == oris_kernel::ErrorKind::PreconditionFailed => {
            Ok(Json(CompleteResponse { success: false, message: Some(e.to_string()) }))
        }
        Err(e) => Err(e.into()),
    }
}

#[tracing::instrument(skip(state, req), fields(run_id = %req.run_id, node_id = %req.node_id, lease_id = %req.lease_id, retryable = req.retryable))]
async fn fail(State(state): State<AppState>, Json(req): Json<FailRequest>) -> Result<Json<FailResponse>, ApiError> {
    let run_id = RunId::from(req.run_id.clone());
    let node_id = NodeId::from(req.node_id.clone());
    let retryable = req.retryable;
    let timings = req.timings.clone().into();

    let Some(run) = state.run_store.get_run(&run_id).await? else {
        return Ok(Json(FailResponse { success: false, should_retry: false }));
    };
    if run.assigned_node_id.as_ref() != Some(&node_id) {
        tracing::warn!(run_id = %req.run_id, node_id = %req.node_id, "fail rejected: node mismatch");
        return Ok(Json(FailResponse { success: false, should_retry: false }));
    }
    let prior_attempts = run.attempt;
    let error_info = req.into_error_info();

    let patch = RunPatch {
        timings: Some(timings),
        error_info: Some(Some(error_info)),
        ..Default::default()
    };
    let failed = state
        .run_store
        .transition_run(&run_id, &[RunStatus::Assigned, RunStatus::Running], RunStatus::Failed, patch)
        .await?;
    state.lease_registry.release_lease(&run_id).await?;
    metrics::counter!("runs_failed_total").increment(1);

    let should_retry = retryable && prior_attempts < state.config.max_attempts;
    if should_retry {
        let retry_patch = RunPatch {
            assigned_node_id: Some(None),
            increment_attempt: true,
            error_info: Some(None),
            ..Default::default()
        };
        state
            .run_store
            .transition_run(&run_id, &[RunStatus::Failed], RunStatus::Pending, retry_patch)
            .await?;
    }
    let _ = failed;

    Ok(Json(FailResponse { success: true, should_retry }))
}
