//! `oris-node-agent` binary: registers with the control plane, then runs
//! the C7 node lease loop until SIGINT.
//!
//! Configuration is read from `ORIS_*` environment variables, matching the
//! convention used by the control-plane binary and the old runtime-bin
//! examples:
//!   ORIS_CONTROL_PLANE_URL   base URL of the execution server (default http://127.0.0.1:8080)
//!   ORIS_NODE_ID             this node's identity (default a generated uuid)
//!   ORIS_NODE_SLOTS          capacity slots advertised at registration (default 4)
//!   ORIS_NODE_REGION         optional region label
//!   ORIS_NODE_ENVIRONMENT    optional environment label
//!   ORIS_MAX_CONCURRENT_LEASES  in-flight lease cap (default 4)
//!   ORIS_HEARTBEAT_INTERVAL_SECONDS  heartbeat cadence (default 15)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use oris_node_agent::executor::{ExecutionError, ExecutionOutput, Executor};
use oris_node_agent::lease_loop::{self, AgentConfig, Concurrency};
use oris_node_agent::ControlPlaneClient;
use serde::Serialize;

/// Demonstration executor: echoes the run's input back as the result.
/// Production deployments wire a real agent runtime behind this trait;
/// the lease loop depends only on [`Executor`].
struct EchoExecutor;

#[async_trait::async_trait]
impl Executor for EchoExecutor {
    async fn execute(
        &self,
        _agent_id: &str,
        _version: &str,
        input: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput { result: input.clone(), ..Default::default() })
    }
}

#[derive(Serialize)]
struct RegisterNodeRequest {
    node_id: String,
    metadata: RegisterMetadata,
    capacity: RegisterCapacity,
}

#[derive(Serialize)]
struct RegisterMetadata {
    region: Option<String>,
    environment: Option<String>,
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct RegisterCapacity {
    slots: u32,
    resource_hints: BTreeMap<String, String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

async fn register_node(base_url: &str, node_id: &str, slots: u32, region: Option<String>, environment: Option<String>) {
    let http = reqwest::Client::new();
    let body = RegisterNodeRequest {
        node_id: node_id.to_string(),
        metadata: RegisterMetadata { region, environment, labels: BTreeMap::new() },
        capacity: RegisterCapacity { slots, resource_hints: BTreeMap::new() },
    };
    match http.post(format!("{base_url}/nodes/register")).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(node_id, "registered with control plane");
        }
        Ok(resp) => {
            tracing::error!(node_id, status = %resp.status(), "node registration rejected");
        }
        Err(e) => {
            tracing::error!(node_id, error = %e, "node registration failed");
        }
    }
}

/// Reports the lease loop's live `Concurrency` counter on every tick, so the
/// control plane's load-based placement sees the node's real headroom
/// (spec.md §4.6: "exposes `availableSlots` for the node's next heartbeat").
async fn heartbeat_loop(base_url: String, node_id: String, interval: Duration, concurrency: Arc<Concurrency>, slots: u32) {
    let http = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let available_slots = concurrency.available_slots() as u32;
        let active_runs = slots.saturating_sub(available_slots);
        let body = serde_json::json!({
            "state": "active",
            "active_runs": active_runs,
            "available_slots": available_slots,
        });
        if let Err(e) = http
            .post(format!("{base_url}/nodes/{node_id}/heartbeat"))
            .json(&body)
            .send()
            .await
        {
            tracing::warn!(node_id = %node_id, error = %e, "heartbeat delivery failed");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let base_url = env_or("ORIS_CONTROL_PLANE_URL", "http://127.0.0.1:8080");
    let node_id = env_or("ORIS_NODE_ID", &uuid::Uuid::new_v4().to_string());
    let slots: u32 = env_or("ORIS_NODE_SLOTS", "4").parse().unwrap_or(4);
    let region = std::env::var("ORIS_NODE_REGION").ok();
    let environment = std::env::var("ORIS_NODE_ENVIRONMENT").ok();
    let max_concurrent_leases: usize = env_or("ORIS_MAX_CONCURRENT_LEASES", "4").parse().unwrap_or(4);
    let heartbeat_seconds: u64 = env_or("ORIS_HEARTBEAT_INTERVAL_SECONDS", "15").parse().unwrap_or(15);

    register_node(&base_url, &node_id, slots, region, environment).await;

    let concurrency = Arc::new(Concurrency::new(max_concurrent_leases.max(1)));

    tokio::spawn(heartbeat_loop(
        base_url.clone(),
        node_id.clone(),
        Duration::from_secs(heartbeat_seconds),
        concurrency.clone(),
        slots,
    ));

    let client = ControlPlaneClient::new(base_url);
    let executor: Arc<dyn Executor> = Arc::new(EchoExecutor);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    lease_loop::run(client, executor, AgentConfig { node_id, max_concurrent_leases }, concurrency, shutdown_rx).await;
}
