//! C2 Run Store: durable run records, the single source of truth for run
//! state (spec.md §4.2).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use oris_events::EventPublisher;
use oris_kernel::{Event, KernelError, KernelResult, Run, RunFilter, RunId, RunPatch, RunStatus};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(
        &self,
        agent_id: &str,
        version: &str,
        input_ref: BTreeMap<String, String>,
    ) -> KernelResult<Run>;

    async fn get_run(&self, run_id: &RunId) -> KernelResult<Option<Run>>;

    async fn list_runs(&self, filter: &RunFilter) -> KernelResult<Vec<Run>>;

    /// Conditional update: fails with `PreconditionFailed` (returns `Ok(None)`
    /// is reserved for "not found"; wrong-state is a recoverable `Err`) if
    /// `from_states` does not contain the run's current status.
    async fn transition_run(
        &self,
        run_id: &RunId,
        from_states: &[RunStatus],
        to_state: RunStatus,
        patch: RunPatch,
    ) -> KernelResult<Run>;

    /// Lock-free cached-counter read feeding the metrics surface (C8)
    /// without blocking the hot path (spec.md §9).
    async fn count_by_status(&self) -> KernelResult<BTreeMap<RunStatus, u64>>;
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            publisher: None,
        }
    }

    pub fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            publisher: Some(publisher),
        }
    }

    async fn emit(&self, run_id: &RunId, from: RunStatus, to: RunStatus) {
        metrics::counter!("run_transitions_total", "from" => from_label(from), "to" => from_label(to)).increment(1);
        if let Some(publisher) = &self.publisher {
            let event = Event::run_state_changed(run_id.as_str(), from, to, Utc::now());
            if let Err(e) = publisher.publish(event).await {
                tracing::warn!(run_id = %run_id, error = %e, "event publish failed after run transition");
            }
        }
    }
}

fn from_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Assigned => "assigned",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(
        &self,
        agent_id: &str,
        version: &str,
        input_ref: BTreeMap<String, String>,
    ) -> KernelResult<Run> {
        let run = Run::new(RunId::generate(), agent_id, version, input_ref, Utc::now());
        self.runs
            .write()
            .expect("run store lock poisoned")
            .insert(run.id.clone(), run.clone());
        metrics::counter!("runs_created_total").increment(1);
        Ok(run)
    }

    async fn get_run(&self, run_id: &RunId) -> KernelResult<Option<Run>> {
        Ok(self.runs.read().expect("run store lock poisoned").get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> KernelResult<Vec<Run>> {
        Ok(self
            .runs
            .read()
            .expect("run store lock poisoned")
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    #[tracing::instrument(skip(self, from_states, patch), fields(run_id = %run_id, to = ?to_state))]
    async fn transition_run(
        &self,
        run_id: &RunId,
        from_states: &[RunStatus],
        to_state: RunStatus,
        patch: RunPatch,
    ) -> KernelResult<Run> {
        let (from, updated) = {
            let mut runs = self.runs.write().expect("run store lock poisoned");
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| KernelError::not_found(format!("run not found: {run_id}")))?;

            if !from_states.contains(&run.status) || !run.status.can_transition_to(to_state) {
                return Err(KernelError::precondition_failed(format!(
                    "cannot transition run {run_id} from {:?} to {:?}",
                    run.status, to_state
                )));
            }

            let from = run.status;
            run.status = to_state;
            if let Some(node) = patch.assigned_node_id {
                run.assigned_node_id = node;
            }
            if let Some(timings) = patch.timings {
                run.timings = timings;
            }
            if let Some(costs) = patch.costs {
                run.costs = costs;
            }
            if let Some(error_info) = patch.error_info {
                run.error_info = error_info;
            }
            if let Some(trace_id) = patch.trace_id {
                run.trace_id = trace_id;
            }
            if patch.increment_attempt {
                run.attempt += 1;
            }
            if let Some(flag) = patch.cancellation_requested {
                run.cancellation_requested = flag;
            }
            (from, run.clone())
        };

        self.emit(run_id, from, to_state).await;
        Ok(updated)
    }

    async fn count_by_status(&self) -> KernelResult<BTreeMap<RunStatus, u64>> {
        let mut counts = BTreeMap::new();
        for run in self.runs.read().expect("run store lock poisoned").values() {
            *counts.entry(run.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn illegal_transition_fails_atomically_and_leaves_state_unchanged() {
        let store = InMemoryRunStore::new();
        let run = store
            .create_run("agent-1", "v1", BTreeMap::new())
            .await
            .unwrap();

        let err = store
            .transition_run(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Assigned,
                RunPatch::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), oris_kernel::ErrorKind::PreconditionFailed);

        let unchanged = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn legal_transition_applies_patch() {
        let store = InMemoryRunStore::new();
        let run = store.create_run("agent-1", "v1", BTreeMap::new()).await.unwrap();

        let patch = RunPatch {
            assigned_node_id: Some(Some(oris_kernel::NodeId::from("node-1"))),
            ..Default::default()
        };
        let updated = store
            .transition_run(&run.id, &[RunStatus::Pending], RunStatus::Assigned, patch)
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Assigned);
        assert_eq!(updated.assigned_node_id, Some(oris_kernel::NodeId::from("node-1")));
    }

    #[tokio::test]
    async fn not_found_is_surfaced_distinctly_from_precondition_failed() {
        let store = InMemoryRunStore::new();
        let err = store
            .transition_run(
                &RunId::from("missing"),
                &[RunStatus::Pending],
                RunStatus::Assigned,
                RunPatch::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), oris_kernel::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn count_by_status_reflects_transitions() {
        let store = InMemoryRunStore::new();
        let run = store.create_run("agent-1", "v1", BTreeMap::new()).await.unwrap();
        store
            .transition_run(&run.id, &[RunStatus::Pending], RunStatus::Assigned, RunPatch::default())
            .await
            .unwrap();
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&RunStatus::Assigned), Some(&1));
        assert_eq!(counts.get(&RunStatus::Pending), None);
    }
}
