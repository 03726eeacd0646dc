//! Background sweeps the control-plane binary runs alongside the HTTP
//! server: the node-heartbeat reaper (spec.md §3 node lifecycle, guarded by
//! the auxiliary distributed lock per §5), the pending-run scheduling sweep
//! that re-evaluates runs whose lease lapsed (spec.md §4.5, S5), and the C8
//! gauge sampler that refreshes node/run/lease counts off the hot path.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use oris_execution_runtime::{DistributedLock, LeaseRegistry, NodeRegistry, RunStore, Scheduler};
use oris_kernel::{RunFilter, RunStatus};

const REAPER_LOCK_KEY: &str = "node-reaper";

/// Runs forever, attempting the reap sweep on every tick. Only the
/// instance holding `node-reaper` in `lock` actually reaps; every other
/// instance's `try_acquire` fails harmlessly and it just waits for the
/// next tick (spec.md §5: "used for operations requiring cross-instance
/// coordination").
pub async fn run_reaper(
    node_registry: Arc<dyn NodeRegistry>,
    lock: Arc<dyn DistributedLock>,
    owner: String,
    heartbeat_timeout: Duration,
    interval: StdDuration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let lock_ttl = Duration::from_std(interval).unwrap_or(Duration::seconds(30)) * 2;
        match lock.try_acquire(REAPER_LOCK_KEY, &owner, lock_ttl).await {
            Ok(true) => match node_registry.reap(heartbeat_timeout, chrono::Utc::now()).await {
                Ok(reaped) if !reaped.is_empty() => {
                    tracing::info!(count = reaped.len(), nodes = ?reaped, "reaped stale nodes");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "node reaper sweep failed"),
            },
            Ok(false) => {
                tracing::debug!("node reaper lock held by another instance, skipping this tick");
            }
            Err(e) => tracing::warn!(error = %e, "node reaper lock acquisition failed"),
        }
    }
}

/// Runs forever, re-attempting scheduling for every `pending` run on each
/// tick. This is what turns a lease expiry (no Complete/Fail before TTL)
/// into a fresh assignment without any caller having to notice and retry
/// (spec.md §4.5's "the next scheduling cycle observes no active lease and
/// reschedules"). Unlike the reaper, this sweep does not need cross-instance
/// coordination: lease acquisition races are resolved inside the scheduler
/// itself (spec.md §7, `Contention` is never surfaced).
pub async fn run_scheduler_sweep(
    run_store: Arc<dyn oris_execution_runtime::RunStore>,
    scheduler: Arc<Scheduler>,
    interval: StdDuration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let pending = match run_store
            .list_runs(&RunFilter { status: Some(RunStatus::Pending), node_id: None, agent_id: None })
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(error = %e, "scheduler sweep: failed to list pending runs");
                continue;
            }
        };
        for run in pending {
            if let Err(e) = scheduler.schedule_run(&run, None).await {
                tracing::warn!(run_id = %run.id, error = %e, "scheduler sweep: scheduling attempt failed");
            }
        }
    }
}

fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Assigned => "assigned",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Refreshes the C8 gauge surface from the lock-free snapshot reads each
/// store exposes (spec.md §9 "Observable gauges via callback"): per-node
/// active-runs/available-slots, per-status run counts, and the count of
/// currently active leases. Runs on its own cadence so these reads never
/// sit on the hot scheduling/transition path.
pub async fn run_metrics_sampler(
    node_registry: Arc<dyn NodeRegistry>,
    run_store: Arc<dyn RunStore>,
    lease_registry: Arc<dyn LeaseRegistry>,
    interval: StdDuration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        match node_registry.list_nodes().await {
            Ok(nodes) => {
                for node in nodes {
                    metrics::gauge!("node_active_runs", "node_id" => node.node_id.clone())
                        .set(node.status.active_runs as f64);
                    metrics::gauge!("node_available_slots", "node_id" => node.node_id.clone())
                        .set(node.status.available_slots as f64);
                }
            }
            Err(e) => tracing::warn!(error = %e, "metrics sampler: failed to list nodes"),
        }

        match run_store.count_by_status().await {
            Ok(counts) => {
                for status in [
                    RunStatus::Pending,
                    RunStatus::Assigned,
                    RunStatus::Running,
                    RunStatus::Completed,
                    RunStatus::Failed,
                    RunStatus::Cancelled,
                ] {
                    let count = counts.get(&status).copied().unwrap_or(0);
                    metrics::gauge!("runs_by_status", "status" => run_status_label(status)).set(count as f64);
                }
            }
            Err(e) => tracing::warn!(error = %e, "metrics sampler: failed to count runs by status"),
        }

        match lease_registry.list_active(chrono::Utc::now()).await {
            Ok(active) => metrics::gauge!("active_leases_total").set(active.len() as f64),
            Err(e) => tracing::warn!(error = %e, "metrics sampler: failed to list active leases"),
        }
    }
}
