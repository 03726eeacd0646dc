//! C7 Node Lease Loop: maintains the Pull stream, dispatches each lease to a
//! bounded pool of processing tasks, and reports the outcome via
//! Complete/Fail (spec.md §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::client::{ControlPlaneClient, CostsWire, LeaseWire, PullFrame, TimingsWire};
use crate::executor::{ExecutionError, Executor};

/// Cancel tokens for leases currently dispatched on this node, keyed by run
/// id. A `PullFrame::Cancel` fires the matching token so `dispatch`'s
/// `tokio::select!` can preempt the executor instead of running to the
/// deadline (spec.md §9 open question: cancellation observed by the executor).
type CancelRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub node_id: String,
    pub max_concurrent_leases: usize,
}

/// Tracks in-flight lease count so the node's heartbeat can report
/// `availableSlots = maxConcurrentLeases - inFlight` (spec.md §4.6).
pub struct Concurrency {
    max: usize,
    in_flight: AtomicUsize,
}

impl Concurrency {
    pub fn new(max: usize) -> Self {
        Self { max, in_flight: AtomicUsize::new(0) }
    }

    pub fn available_slots(&self) -> usize {
        self.max.saturating_sub(self.in_flight.load(Ordering::Relaxed))
    }
}

/// Runs the reconnect-and-dispatch loop until `shutdown` resolves. Each
/// successful stream connection resets the backoff attempt counter; a
/// disconnect or stream error reconnects after a jittered delay.
pub async fn run(
    client: ControlPlaneClient,
    executor: Arc<dyn Executor>,
    config: AgentConfig,
    concurrency: Arc<Concurrency>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_leases.max(1)));
    let mut backoff = Backoff::new();
    let cancel_registry: CancelRegistry = Arc::new(Mutex::new(HashMap::new()));

    loop {
        if shutdown.try_recv().is_ok() {
            tracing::info!("node lease loop stopping: shutdown requested");
            return;
        }

        let stream = match client.pull_stream(&config.node_id, config.max_concurrent_leases.max(1)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "pull stream failed to establish, backing off");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = &mut shutdown => { return; }
                }
                continue;
            }
        };
        backoff.reset();
        tracing::info!(node_id = %config.node_id, "pull stream established");

        tokio::pin!(stream);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("node lease loop stopping: shutdown requested mid-stream");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(PullFrame::Lease(lease))) => {
                            dispatch(
                                lease,
                                client.clone(),
                                executor.clone(),
                                semaphore.clone(),
                                concurrency.clone(),
                                config.node_id.clone(),
                                cancel_registry.clone(),
                            );
                        }
                        Some(Ok(PullFrame::Cancel { run_id })) => {
                            if let Some(token) = cancel_registry.lock().unwrap().remove(&run_id) {
                                tracing::info!(run_id = %run_id, "cancel frame received, preempting executor");
                                token.cancel();
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "pull stream frame error, reconnecting");
                            break;
                        }
                        None => {
                            tracing::warn!("pull stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    lease: LeaseWire,
    client: ControlPlaneClient,
    executor: Arc<dyn Executor>,
    semaphore: Arc<Semaphore>,
    concurrency: Arc<Concurrency>,
    node_id: String,
    cancel_registry: CancelRegistry,
) {
    let cancel_token = CancellationToken::new();
    cancel_registry.lock().unwrap().insert(lease.run_id.clone(), cancel_token.clone());

    tokio::spawn(async move {
        let Ok(permit) = semaphore.acquire_owned().await else {
            cancel_registry.lock().unwrap().remove(&lease.run_id);
            return;
        };
        concurrency.in_flight.fetch_add(1, Ordering::Relaxed);

        client.ack(&lease.lease_id, &node_id, Utc::now().timestamp_millis()).await;

        let now_ms = Utc::now().timestamp_millis();
        let deadline_budget = (lease.deadline_unix_ms - now_ms).max(0) as u64;
        let budget_ms = lease
            .run_spec
            .budgets
            .max_duration_seconds
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(u64::MAX);
        let timeout = Duration::from_millis(deadline_budget.min(budget_ms));

        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => None,
            r = tokio::time::timeout(
                timeout,
                executor.execute(&lease.run_spec.agent_id, &lease.run_spec.version, &lease.run_spec.input_ref),
            ) => Some(r),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Some(Ok(Ok(output))) => {
                let timings = TimingsWire { duration_ms: Some(duration_ms), queue_ms: None, execution_ms: Some(duration_ms) };
                let costs = CostsWire { tokens_in: output.tokens_in, tokens_out: output.tokens_out, usd_cost: output.usd_cost };
                if let Err(e) = client
                    .complete(&lease.lease_id, &lease.run_id, &node_id, output.result, timings, costs)
                    .await
                {
                    tracing::error!(run_id = %lease.run_id, error = %e, "complete call failed");
                }
            }
            Some(Ok(Err(ExecutionError { message, details, retryable }))) => {
                report_failure(&client, &lease, &node_id, duration_ms, message, details, retryable).await;
            }
            Some(Err(_elapsed)) => {
                report_failure(
                    &client,
                    &lease,
                    &node_id,
                    duration_ms,
                    "deadline exceeded".to_string(),
                    None,
                    false,
                )
                .await;
            }
            None => {
                report_failure(
                    &client,
                    &lease,
                    &node_id,
                    duration_ms,
                    "cancelled by operator".to_string(),
                    None,
                    false,
                )
                .await;
            }
        }

        concurrency.in_flight.fetch_sub(1, Ordering::Relaxed);
        cancel_registry.lock().unwrap().remove(&lease.run_id);
        drop(permit);
    });
}

async fn report_failure(
    client: &ControlPlaneClient,
    lease: &LeaseWire,
    node_id: &str,
    duration_ms: u64,
    message: String,
    details: Option<serde_json::Value>,
    retryable: bool,
) {
    let timings = TimingsWire { duration_ms: Some(duration_ms), queue_ms: None, execution_ms: Some(duration_ms) };
    if let Err(e) = client
        .fail(&lease.lease_id, &lease.run_id, node_id, &message, details, timings, retryable)
        .await
    {
        tracing::error!(run_id = %lease.run_id, error = %e, "fail call failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_slots_decreases_as_in_flight_grows() {
        let c = Concurrency::new(3);
        assert_eq!(c.available_slots(), 3);
        c.in_flight.fetch_add(2, Ordering::Relaxed);
        assert_eq!(c.available_slots(), 1);
    }

    #[test]
    fn available_slots_never_underflows() {
        let c = Concurrency::new(1);
        c.in_flight.fetch_add(5, Ordering::Relaxed);
        assert_eq!(c.available_slots(), 0);
    }
}
