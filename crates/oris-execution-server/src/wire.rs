//! Wire-level DTOs for the streaming lease protocol and REST surface
//! (spec.md §6). Field names mirror the spec's semantic labels.

use std::collections::BTreeMap;

use oris_kernel::{Budgets, Costs, ErrorInfo, Lease, Run, Timings};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSpecWire {
    pub agent_id: String,
    pub version: String,
    pub deployment_id: Option<String>,
    pub input_ref: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub budgets: Budgets,
}

/// `{leaseId, runId, runSpec{...}, deadlineUnixMs, traceId}` (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseWire {
    pub lease_id: String,
    pub run_id: String,
    pub run_spec: RunSpecWire,
    pub deadline_unix_ms: i64,
    pub trace_id: Option<String>,
}

impl LeaseWire {
    pub fn from_run_and_lease(run: &Run, lease: &Lease) -> Self {
        Self {
            lease_id: lease.lease_id.as_str().to_string(),
            run_id: run.id.as_str().to_string(),
            run_spec: RunSpecWire {
                agent_id: run.agent_id.clone(),
                version: run.version.clone(),
                deployment_id: run.deployment_id.clone(),
                input_ref: run.input_ref.clone(),
                metadata: BTreeMap::new(),
                budgets: Budgets::default(),
            },
            deadline_unix_ms: lease.expires_at.timestamp_millis(),
            trace_id: run.trace_id.clone(),
        }
    }
}

/// One NDJSON line on the Pull stream body: either a freshly assignable
/// lease, or a notice that a run already streamed to this node has been
/// cancelled (spec.md §9 open question: cancellation delivered to the
/// executor, not just silently dropped at the next poll).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum StreamFrame {
    Lease(LeaseWire),
    Cancel { run_id: String },
}

#[derive(Clone, Debug, Deserialize)]
pub struct AckRequest {
    pub lease_id: String,
    pub node_id: String,
    pub timestamp_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TimingsWire {
    pub duration_ms: Option<u64>,
    pub queue_ms: Option<u64>,
    pub execution_ms: Option<u64>,
}

impl From<TimingsWire> for Timings {
    fn from(t: TimingsWire) -> Self {
        Timings {
            duration_ms: t.duration_ms,
            queue_ms: t.queue_ms,
            execution_ms: t.execution_ms,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CostsWire {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub usd_cost: Option<f64>,
}

impl From<CostsWire> for Costs {
    fn from(c: CostsWire) -> Self {
        Costs {
            tokens_in: c.tokens_in,
            tokens_out: c.tokens_out,
            usd_cost: c.usd_cost,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompleteRequest {
    pub lease_id: String,
    pub run_id: String,
    pub node_id: String,
    #[serde(default)]
    pub result: BTreeMap<String, String>,
    #[serde(default)]
    pub timings: TimingsWire,
    #[serde(default)]
    pub costs: CostsWire,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompleteResponse {
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FailRequest {
    pub lease_id: String,
    pub run_id: String,
    pub node_id: String,
    pub error_message: String,
    #[serde(default)]
    pub error_details: Option<serde_json::Value>,
    #[serde(default)]
    pub timings: TimingsWire,
    pub retryable: bool,
}

impl FailRequest {
    pub fn into_error_info(self) -> ErrorInfo {
        ErrorInfo {
            message: self.error_message,
            details: self.error_details,
            retryable: self.retryable,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FailResponse {
    pub success: bool,
    pub should_retry: bool,
}
