//! §6 REST surface: the thin wrapper needed to drive the core end-to-end
//! without a node — create/list/inspect runs, administrative
//! complete/fail/cancel parity with the RPC surface, and node CRUD.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use oris_events::EventPublisher;
use oris_kernel::{
    Costs, ErrorInfo, NodeCapacity, NodeId, NodeMetadata, NodeLiveStatus, Run, RunFilter, RunId,
    RunPatch, RunStatus, Timings,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/complete", post(admin_complete))
        .route("/runs/:id/fail", post(admin_fail))
        .route("/runs/:id/cancel", post(admin_cancel))
        .route("/nodes/register", post(register_node))
        .route("/nodes/:id/heartbeat", post(heartbeat_node))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id", delete(delete_node))
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub agent_id: String,
    pub version: String,
    #[serde(default)]
    pub input: BTreeMap<String, String>,
}

async fn create_run(State(state): State<AppState>, Json(req): Json<CreateRunRequest>) -> Result<Json<Run>, ApiError> {
    let run = state.run_store.create_run(&req.agent_id, &req.version, req.input).await?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsParams {
    pub status: Option<String>,
    pub node_id: Option<String>,
    pub agent_id: Option<String>,
}

fn parse_status(s: &str) -> Option<RunStatus> {
    match s {
        "pending" => Some(RunStatus::Pending),
        "assigned" => Some(RunStatus::Assigned),
        "running" => Some(RunStatus::Running),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        "cancelled" => Some(RunStatus::Cancelled),
        _ => None,
    }
}

async fn list_runs(State(state): State<AppState>, Query(params): Query<ListRunsParams>) -> Result<Json<Vec<Run>>, ApiError> {
    let filter = RunFilter {
        status: params.status.as_deref().and_then(parse_status),
        node_id: params.node_id.map(NodeId::from),
        agent_id: params.agent_id,
    };
    let runs = state.run_store.list_runs(&filter).await?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Run>, ApiError> {
    match state.run_store.get_run(&RunId::from(id)).await? {
        Some(run) => Ok(Json(run)),
        None => Err(oris_kernel::KernelError::not_found("run not found").into()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminCompleteRequest {
    #[serde(default)]
    pub timings: AdminTimings,
    #[serde(default)]
    pub costs: AdminCosts,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminTimings {
    pub duration_ms: Option<u64>,
    pub queue_ms: Option<u64>,
    pub execution_ms: Option<u64>,
}

impl From<AdminTimings> for Timings {
    fn from(t: AdminTimings) -> Self {
        Timings { duration_ms: t.duration_ms, queue_ms: t.queue_ms, execution_ms: t.execution_ms }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminCosts {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub usd_cost: Option<f64>,
}

impl From<AdminCosts> for Costs {
    fn from(c: AdminCosts) -> Self {
        Costs { tokens_in: c.tokens_in, tokens_out: c.tokens_out, usd_cost: c.usd_cost }
    }
}

async fn admin_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AdminCompleteRequest>,
) -> Result<Json<Run>, ApiError> {
    let run_id = RunId::from(id);
    let patch = RunPatch {
        timings: Some(req.timings.into()),
        costs: Some(req.costs.into()),
        ..Default::default()
    };
    let run = state
        .run_store
        .transition_run(&run_id, &[RunStatus::Assigned, RunStatus::Running], RunStatus::Completed, patch)
        .await?;
    state.lease_registry.release_lease(&run_id).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct AdminFailRequest {
    pub error_message: String,
    #[serde(default)]
    pub error_details: Option<serde_json::Value>,
    #[serde(default)]
    pub retryable: bool,
}

async fn admin_fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AdminFailRequest>,
) -> Result<Json<Run>, ApiError> {
    let run_id = RunId::from(id);
    let patch = RunPatch {
        error_info: Some(Some(ErrorInfo {
            message: req.error_message,
            details: req.error_details,
            retryable: req.retryable,
        })),
        ..Default::default()
    };
    let run = state
        .run_store
        .transition_run(&run_id, &[RunStatus::Assigned, RunStatus::Running], RunStatus::Failed, patch)
        .await?;
    state.lease_registry.release_lease(&run_id).await?;
    Ok(Json(run))
}

async fn admin_cancel(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Run>, ApiError> {
    let run_id = RunId::from(id);
    let current = state
        .run_store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| oris_kernel::KernelError::not_found("run not found"))?;

    // Best-effort preemption: if the run currently holds a lease, flag
    // `cancellation_requested` so the Pull stream's next poll delivers a
    // cancel frame to the holding node (SPEC_FULL §10 Q2) even though this
    // call itself transitions the run straight to `cancelled` rather than
    // waiting for the node to confirm preemption.
    let patch = if current.status.has_active_lease() {
        RunPatch { cancellation_requested: Some(true), ..Default::default() }
    } else {
        RunPatch::default()
    };

    let run = if current.status == RunStatus::Running {
        state
            .run_store
            .transition_run(&run_id, &[RunStatus::Running], RunStatus::Cancelled, patch)
            .await?
    } else {
        state
            .run_store
            .transition_run(&run_id, &[RunStatus::Pending, RunStatus::Assigned], RunStatus::Cancelled, patch)
            .await?
    };
    state.lease_registry.release_lease(&run_id).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    #[serde(default)]
    pub metadata: NodeMetadata,
    pub capacity: NodeCapacity,
}

async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<oris_kernel::Node>, ApiError> {
    let node = state.node_registry.register(&req.node_id, req.metadata, req.capacity).await?;
    publish_best_effort(&state, oris_kernel::Event::node_registered(&node.node_id, chrono::Utc::now())).await;
    Ok(Json(node))
}

async fn heartbeat_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(status): Json<NodeLiveStatus>,
) -> Result<Json<oris_kernel::Node>, ApiError> {
    match state.node_registry.heartbeat(&id, status).await? {
        Some(node) => {
            publish_best_effort(&state, oris_kernel::Event::node_heartbeat(&node.node_id, chrono::Utc::now())).await;
            Ok(Json(node))
        }
        None => Err(oris_kernel::KernelError::not_found("node not found").into()),
    }
}

async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<oris_kernel::Node>>, ApiError> {
    Ok(Json(state.node_registry.list_nodes().await?))
}

async fn delete_node(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeleteResult>, ApiError> {
    let deleted = state.node_registry.delete(&id).await?;
    if deleted {
        publish_best_effort(&state, oris_kernel::Event::node_disconnected(&id, chrono::Utc::now())).await;
    }
    Ok(Json(DeleteResult { deleted }))
}

/// Node lifecycle events are best-effort (spec.md §4.8): a publish failure
/// is logged and never turns a successful registry mutation into an error.
async fn publish_best_effort(state: &AppState, event: oris_kernel::Event) {
    if let Err(e) = state.events.publish(event).await {
        tracing::warn!(error = %e, "node lifecycle event publish failed");
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResult {
    pub deleted: bool,
}
