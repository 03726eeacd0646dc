//! The run: the unit of scheduled work (spec.md §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{NodeId, RunId};

/// Run status. Transitions form a DAG; see [`RunStatus::can_transition_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether `self -> to` is a legal edge in the run state machine (spec.md §4.7).
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                // a retryable failure recycles the same run id back to pending (spec.md §9).
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Runs in these statuses are expected to hold an active lease.
    pub fn has_active_lease(self) -> bool {
        matches!(self, RunStatus::Assigned | RunStatus::Running)
    }
}

/// Per-run wall-clock accounting, populated incrementally as the run progresses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Timings {
    pub duration_ms: Option<u64>,
    pub queue_ms: Option<u64>,
    pub execution_ms: Option<u64>,
}

/// Token/currency accounting reported by the node on completion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Costs {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub usd_cost: Option<f64>,
}

/// Structured error info carried on a failed run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorInfo {
    pub message: String,
    pub details: Option<Value>,
    pub retryable: bool,
}

/// Per-run execution caps enforced by the node lease loop (spec.md §4.6).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Budgets {
    pub max_tokens: Option<u64>,
    pub max_duration_seconds: Option<u64>,
}

/// Everything the executor needs, opaque to the core beyond these fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunSpec {
    pub agent_id: String,
    pub version: String,
    pub deployment_id: Option<String>,
    pub input_ref: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub budgets: Budgets,
}

/// The run record, owned exclusively by the run store (C2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub agent_id: String,
    pub version: String,
    pub deployment_id: Option<String>,
    pub input_ref: BTreeMap<String, String>,
    pub status: RunStatus,
    pub timings: Timings,
    pub costs: Costs,
    pub error_info: Option<ErrorInfo>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Node currently (or, for terminal runs, formerly) assigned to this run.
    /// Retained after completion for audit (spec.md §9 open question, resolved yes).
    pub assigned_node_id: Option<NodeId>,
    /// Number of dispatch attempts so far; required to be visible per spec.md §9.
    pub attempt: u32,
    /// Set when `Cancel` is called on a run that currently holds a lease
    /// (`assigned` or `running`); the lease stream's Pull loop notifies the
    /// holding node with a cancel frame so it can best-effort-preempt the
    /// executor (spec.md §9 open question).
    pub cancellation_requested: bool,
}

impl Run {
    pub fn new(
        id: RunId,
        agent_id: impl Into<String>,
        version: impl Into<String>,
        input_ref: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            agent_id: agent_id.into(),
            version: version.into(),
            deployment_id: None,
            input_ref,
            status: RunStatus::Pending,
            timings: Timings::default(),
            costs: Costs::default(),
            error_info: None,
            trace_id: None,
            created_at,
            assigned_node_id: None,
            attempt: 0,
            cancellation_requested: false,
        }
    }
}

/// Patch applied atomically with a status transition in `TransitionRun`.
#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub assigned_node_id: Option<Option<NodeId>>,
    pub timings: Option<Timings>,
    pub costs: Option<Costs>,
    pub error_info: Option<Option<ErrorInfo>>,
    pub trace_id: Option<Option<String>>,
    pub increment_attempt: bool,
    /// `Some(flag)` overwrites `cancellation_requested`; `None` leaves it
    /// untouched. Set `Some(true)` when an admin `Cancel` targets a run that
    /// currently holds a lease, so the node can observe the request (spec.md
    /// §9 open question: cancellation must be delivered to the executor).
    pub cancellation_requested: Option<bool>,
}

/// Filter accepted by `ListRuns` (spec.md §4.2).
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub node_id: Option<NodeId>,
    pub agent_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if run.assigned_node_id.as_ref() != Some(node_id) {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &run.agent_id != agent_id {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_dag() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Assigned));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
        assert!(RunStatus::Assigned.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Assigned));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn terminal_statuses_have_no_active_lease() {
        for s in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(s.is_terminal());
            assert!(!s.has_active_lease());
        }
        assert!(RunStatus::Assigned.has_active_lease());
        assert!(RunStatus::Running.has_active_lease());
    }
}
