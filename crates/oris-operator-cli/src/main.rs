//! `oris-operator-cli`: administrative client for the §6 REST surface —
//! run/node CRUD and the RPC-parity complete/fail/cancel routes, for
//! driving or inspecting a control plane without a real node.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "oris-operator-cli", version, about = "Administrative CLI for the Oris control plane")]
struct Cli {
    /// Base URL of the control plane's execution server.
    #[arg(long, env = "ORIS_CONTROL_PLANE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run lifecycle: create, list, inspect, and administrative parity with the RPC surface.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Node lifecycle: register, heartbeat, list, delete.
    Nodes {
        #[command(subcommand)]
        action: NodesAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    Create(CreateRunArgs),
    List(ListRunsArgs),
    Get { run_id: String },
    Complete(CompleteRunArgs),
    Fail(FailRunArgs),
    Cancel { run_id: String },
}

#[derive(Args)]
struct CreateRunArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long)]
    version: String,
    /// Repeatable `key=value` input pairs.
    #[arg(long = "input", value_parser = parse_key_value)]
    input: Vec<(String, String)>,
}

#[derive(Args, Default)]
struct ListRunsArgs {
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    node_id: Option<String>,
    #[arg(long)]
    agent_id: Option<String>,
}

#[derive(Args)]
struct CompleteRunArgs {
    run_id: String,
    #[arg(long)]
    duration_ms: Option<u64>,
    #[arg(long)]
    tokens_in: Option<u64>,
    #[arg(long)]
    tokens_out: Option<u64>,
    #[arg(long)]
    usd_cost: Option<f64>,
}

#[derive(Args)]
struct FailRunArgs {
    run_id: String,
    #[arg(long)]
    message: String,
    #[arg(long)]
    retryable: bool,
}

#[derive(Subcommand)]
enum NodesAction {
    Register(RegisterNodeArgs),
    Heartbeat(HeartbeatArgs),
    List,
    Delete { node_id: String },
}

#[derive(Args)]
struct RegisterNodeArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long)]
    slots: u32,
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    environment: Option<String>,
}

#[derive(Args)]
struct HeartbeatArgs {
    node_id: String,
    #[arg(long, default_value = "active")]
    state: String,
    #[arg(long, default_value_t = 0)]
    active_runs: u32,
    #[arg(long, default_value_t = 0)]
    available_slots: u32,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected key=value, got {s:?}")),
    }
}

async fn print_json_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("request failed: {status}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let http = reqwest::Client::new();

    match cli.command {
        Command::Runs { action } => run_runs_command(&http, &cli.base_url, action).await,
        Command::Nodes { action } => run_nodes_command(&http, &cli.base_url, action).await,
    }
}

async fn run_runs_command(http: &reqwest::Client, base_url: &str, action: RunsAction) -> Result<()> {
    match action {
        RunsAction::Create(args) => {
            let input: BTreeMap<String, String> = args.input.into_iter().collect();
            let body = serde_json::json!({
                "agent_id": args.agent_id,
                "version": args.version,
                "input": input,
            });
            let resp = http.post(format!("{base_url}/runs")).json(&body).send().await.context("POST /runs")?;
            print_json_response(resp).await
        }
        RunsAction::List(args) => {
            let mut query = Vec::new();
            if let Some(status) = &args.status {
                query.push(("status", status.as_str()));
            }
            if let Some(node_id) = &args.node_id {
                query.push(("node_id", node_id.as_str()));
            }
            if let Some(agent_id) = &args.agent_id {
                query.push(("agent_id", agent_id.as_str()));
            }
            let resp = http.get(format!("{base_url}/runs")).query(&query).send().await.context("GET /runs")?;
            print_json_response(resp).await
        }
        RunsAction::Get { run_id } => {
            let resp = http.get(format!("{base_url}/runs/{run_id}")).send().await.context("GET /runs/{id}")?;
            print_json_response(resp).await
        }
        RunsAction::Complete(args) => {
            let body = serde_json::json!({
                "timings": { "duration_ms": args.duration_ms },
                "costs": {
                    "tokens_in": args.tokens_in,
                    "tokens_out": args.tokens_out,
                    "usd_cost": args.usd_cost,
                },
            });
            let resp = http
                .post(format!("{base_url}/runs/{}/complete", args.run_id))
                .json(&body)
                .send()
                .await
                .context("POST /runs/{id}/complete")?;
            print_json_response(resp).await
        }
        RunsAction::Fail(args) => {
            let body = serde_json::json!({
                "error_message": args.message,
                "retryable": args.retryable,
            });
            let resp = http
                .post(format!("{base_url}/runs/{}/fail", args.run_id))
                .json(&body)
                .send()
                .await
                .context("POST /runs/{id}/fail")?;
            print_json_response(resp).await
        }
        RunsAction::Cancel { run_id } => {
            let resp = http
                .post(format!("{base_url}/runs/{run_id}/cancel"))
                .send()
                .await
                .context("POST /runs/{id}/cancel")?;
            print_json_response(resp).await
        }
    }
}

async fn run_nodes_command(http: &reqwest::Client, base_url: &str, action: NodesAction) -> Result<()> {
    match action {
        NodesAction::Register(args) => {
            let body = serde_json::json!({
                "node_id": args.node_id,
                "metadata": { "region": args.region, "environment": args.environment, "labels": {} },
                "capacity": { "slots": args.slots, "resource_hints": {} },
            });
            let resp = http
                .post(format!("{base_url}/nodes/register"))
                .json(&body)
                .send()
                .await
                .context("POST /nodes/register")?;
            print_json_response(resp).await
        }
        NodesAction::Heartbeat(args) => {
            let body = serde_json::json!({
                "state": args.state,
                "active_runs": args.active_runs,
                "available_slots": args.available_slots,
            });
            let resp = http
                .post(format!("{base_url}/nodes/{}/heartbeat", args.node_id))
                .json(&body)
                .send()
                .await
                .context("POST /nodes/{id}/heartbeat")?;
            print_json_response(resp).await
        }
        NodesAction::List => {
            let resp = http.get(format!("{base_url}/nodes")).send().await.context("GET /nodes")?;
            print_json_response(resp).await
        }
        NodesAction::Delete { node_id } => {
            let resp = http
                .delete(format!("{base_url}/nodes/{node_id}"))
                .send()
                .await
                .context("DELETE /nodes/{id}")?;
            print_json_response(resp).await
        }
    }
}
