//! C4 Scheduler: least-loaded placement with hard constraints and
//! lease-race retry (spec.md §4.4).

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use oris_kernel::{
    KernelResult, NodeId, Run, RunId, RunPatch, RunStatus, ScheduleConstraints,
};

use crate::lease_registry::LeaseRegistry;
use crate::node_registry::NodeRegistry;
use crate::run_store::RunStore;

/// Tuning knobs the scheduler is constructed with; TTL is the one the
/// spec ties to a component default rather than a caller-supplied value.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub lease_ttl: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::seconds(30),
            heartbeat_timeout: Duration::seconds(60),
        }
    }
}

pub struct Scheduler {
    lease_registry: Arc<dyn LeaseRegistry>,
    node_registry: Arc<dyn NodeRegistry>,
    run_store: Arc<dyn RunStore>,
    config: SchedulerConfig,
}

/// Why a scheduling attempt produced no placement; feeds the
/// `scheduling_failures_total{reason=...}` counter label (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoCapacityReason {
    NoActiveNodes,
    NoEligibleNodes,
    NoCapacity,
}

impl NoCapacityReason {
    fn label(self) -> &'static str {
        match self {
            NoCapacityReason::NoActiveNodes => "no_active_nodes",
            NoCapacityReason::NoEligibleNodes => "no_eligible_nodes",
            NoCapacityReason::NoCapacity => "no_capacity",
        }
    }
}

impl Scheduler {
    pub fn new(
        lease_registry: Arc<dyn LeaseRegistry>,
        node_registry: Arc<dyn NodeRegistry>,
        run_store: Arc<dyn RunStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lease_registry,
            node_registry,
            run_store,
            config,
        }
    }

    /// Picks a node for `run` per the algorithm in spec.md §4.4, then
    /// atomically acquires a lease and transitions the run to `assigned`.
    /// Returns `Ok(None)` only when no eligible node exists or every
    /// acquisition attempt loses its race — never an error for that case.
    #[tracing::instrument(skip(self, run, constraints), fields(run_id = %run.id))]
    pub async fn schedule_run(
        &self,
        run: &Run,
        constraints: Option<&ScheduleConstraints>,
    ) -> KernelResult<Option<NodeId>> {
        let started = Instant::now();
        metrics::counter!("scheduling_attempts_total").increment(1);

        let result = self.try_schedule(run, constraints).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("scheduling_duration_ms").record(elapsed_ms);

        match &result {
            Ok(Some(_)) => {}
            Ok(None) => {
                // try_schedule already recorded the specific reason; this
                // branch only exists so the duration histogram above covers
                // the null path too (SPEC_FULL §5).
            }
            Err(_) => {}
        }
        result
    }

    async fn try_schedule(
        &self,
        run: &Run,
        constraints: Option<&ScheduleConstraints>,
    ) -> KernelResult<Option<NodeId>> {
        let now = Utc::now();
        let all_nodes = self.node_registry.list_nodes().await?;

        let live_nodes: Vec<_> = all_nodes
            .into_iter()
            .filter(|n| n.is_live(now, self.config.heartbeat_timeout))
            .collect();

        if live_nodes.is_empty() {
            self.record_failure(NoCapacityReason::NoActiveNodes);
            return Ok(None);
        }

        let mut candidates: Vec<_> = live_nodes
            .into_iter()
            .filter(|n| constraints.map(|c| c.is_satisfied_by(n)).unwrap_or(true))
            .collect();

        if candidates.is_empty() {
            self.record_failure(NoCapacityReason::NoEligibleNodes);
            return Ok(None);
        }

        candidates.retain(|n| n.status.available_slots > 0);
        if candidates.is_empty() {
            self.record_failure(NoCapacityReason::NoCapacity);
            return Ok(None);
        }

        // Step 5: (load% asc, available_slots desc), ties broken by node id
        // for a stable, reproducible order.
        candidates.sort_by(|a, b| {
            a.load_fraction()
                .partial_cmp(&b.load_fraction())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.status.available_slots.cmp(&a.status.available_slots))
                .then(a.node_id.cmp(&b.node_id))
        });

        // Step 6/7: bounded retry loop so a storm of lease races always
        // terminates (SPEC_FULL §5) instead of looping unboundedly.
        let attempts = candidates.len();
        for _ in 0..attempts {
            if candidates.is_empty() {
                break;
            }
            let candidate = candidates.remove(0);
            let node_id = NodeId::from(candidate.node_id.as_str());

            let acquired = self
                .lease_registry
                .acquire_lease(&run.id, &node_id, self.config.lease_ttl)
                .await?;
            if !acquired {
                // Contention (spec.md §7): never surfaced, just try the next node.
                continue;
            }

            let patch = RunPatch {
                assigned_node_id: Some(Some(node_id.clone())),
                ..Default::default()
            };
            match self
                .run_store
                .transition_run(&run.id, &[RunStatus::Pending], RunStatus::Assigned, patch)
                .await
            {
                Ok(_) => return Ok(Some(node_id)),
                Err(_) => {
                    // Lost the race to transition the run out of pending
                    // (another scheduler instance got there first); release
                    // the lease we just took and stop — the run is already
                    // assigned elsewhere.
                    self.lease_registry.release_lease(&run.id).await?;
                    return Ok(None);
                }
            }
        }

        self.record_failure(NoCapacityReason::NoCapacity);
        Ok(None)
    }

    fn record_failure(&self, reason: NoCapacityReason) {
        metrics::counter!("scheduling_failures_total", "reason" => reason.label()).increment(1);
    }

    /// Re-evaluates a single pending run id, used by the periodic
    /// "reschedule anything whose lease lapsed" sweep (spec.md §4.5/S5).
    pub async fn reschedule_pending(&self, run_id: &RunId) -> KernelResult<Option<NodeId>> {
        match self.run_store.get_run(run_id).await? {
            Some(run) if run.status == RunStatus::Pending => self.schedule_run(&run, None).await,
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_registry::InMemoryLeaseRegistry;
    use crate::node_registry::InMemoryNodeRegistry;
    use crate::run_store::InMemoryRunStore;
    use oris_kernel::{NodeCapacity, NodeLiveStatus, NodeMetadata, NodeState};
    use std::collections::BTreeMap;

    async fn harness() -> (Scheduler, Arc<InMemoryNodeRegistry>, Arc<InMemoryRunStore>) {
        let leases = Arc::new(InMemoryLeaseRegistry::new());
        let nodes = Arc::new(InMemoryNodeRegistry::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let scheduler = Scheduler::new(
            leases.clone(),
            nodes.clone(),
            runs.clone(),
            SchedulerConfig::default(),
        );
        (scheduler, nodes, runs)
    }

    async fn register_node(nodes: &InMemoryNodeRegistry, id: &str, region: &str, slots: u32, active: u32) {
        nodes
            .register(
                id,
                NodeMetadata {
                    region: Some(region.to_string()),
                    environment: Some("prod".to_string()),
                    labels: BTreeMap::new(),
                },
                NodeCapacity {
                    slots,
                    resource_hints: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        nodes
            .heartbeat(
                id,
                NodeLiveStatus {
                    state: NodeState::Active,
                    active_runs: active,
                    available_slots: slots - active,
                },
            )
            .await
            .unwrap();
    }

    // S1: happy path, single live node.
    #[tokio::test]
    async fn s1_schedules_to_the_only_live_node() {
        let (scheduler, nodes, runs) = harness().await;
        register_node(&nodes, "N1", "r1", 4, 0).await;
        let run = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();

        let assigned = scheduler.schedule_run(&run, None).await.unwrap();
        assert_eq!(assigned, Some(NodeId::from("N1")));
        let updated = runs.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(updated.status, RunStatus::Assigned);
        assert_eq!(updated.assigned_node_id, Some(NodeId::from("N1")));
    }

    // S2: region constraint filters ineligible nodes; no match -> null, run stays pending.
    #[tokio::test]
    async fn s2_region_constraint_filters_and_reports_no_eligible_nodes() {
        let (scheduler, nodes, runs) = harness().await;
        register_node(&nodes, "N1", "r1", 4, 0).await;
        register_node(&nodes, "N2", "r2", 4, 0).await;

        let r2 = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();
        let c = ScheduleConstraints {
            region: Some(vec!["r1".into()]),
            ..Default::default()
        };
        assert_eq!(
            scheduler.schedule_run(&r2, Some(&c)).await.unwrap(),
            Some(NodeId::from("N1"))
        );

        let r3 = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();
        let c = ScheduleConstraints {
            region: Some(vec!["r3".into()]),
            ..Default::default()
        };
        assert_eq!(scheduler.schedule_run(&r3, Some(&c)).await.unwrap(), None);
        let unchanged = runs.get_run(&r3.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RunStatus::Pending);
    }

    // S3: least-loaded wins; tie-breaker prefers more available slots.
    #[tokio::test]
    async fn s3_picks_least_loaded_with_available_slots_tiebreak() {
        let (scheduler, nodes, runs) = harness().await;
        register_node(&nodes, "N1", "r1", 4, 3).await; // load 75%
        register_node(&nodes, "N2", "r1", 4, 1).await; // load 25%, 3 avail
        register_node(&nodes, "N3", "r1", 4, 1).await; // load 25%, but override avail below
        nodes
            .heartbeat(
                "N3",
                NodeLiveStatus {
                    state: NodeState::Active,
                    active_runs: 1,
                    available_slots: 2,
                },
            )
            .await
            .unwrap();

        let run = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();
        assert_eq!(
            scheduler.schedule_run(&run, None).await.unwrap(),
            Some(NodeId::from("N2"))
        );
    }

    // S6-adjacent: draining nodes are live but never scheduling targets.
    #[tokio::test]
    async fn draining_nodes_are_never_scheduling_targets() {
        let (scheduler, nodes, runs) = harness().await;
        register_node(&nodes, "N1", "r1", 4, 0).await;
        nodes
            .heartbeat(
                "N1",
                NodeLiveStatus {
                    state: NodeState::Draining,
                    active_runs: 0,
                    available_slots: 4,
                },
            )
            .await
            .unwrap();

        let run = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();
        assert_eq!(scheduler.schedule_run(&run, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn no_nodes_at_all_reports_no_capacity() {
        let (scheduler, _nodes, runs) = harness().await;
        let run = runs.create_run("A1", "v1", BTreeMap::new()).await.unwrap();
        assert_eq!(scheduler.schedule_run(&run, None).await.unwrap(), None);
    }
}
