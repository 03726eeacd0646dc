//! Shared application state for the execution server's axum handlers.

use std::sync::Arc;

use chrono::Duration;
use oris_events::EventPublisher;
use oris_execution_runtime::{LeaseRegistry, NodeRegistry, RunStore, Scheduler};

/// Control knobs exposed on the wire/REST surface (SPEC_FULL §3's
/// `ORIS_*` environment convention maps onto these fields in the binary).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub lease_default_ttl: Duration,
    pub max_attempts: u32,
    pub pull_poll_interval: std::time::Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lease_default_ttl: Duration::seconds(30),
            max_attempts: 3,
            pull_poll_interval: std::time::Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub lease_registry: Arc<dyn LeaseRegistry>,
    pub node_registry: Arc<dyn NodeRegistry>,
    pub run_store: Arc<dyn RunStore>,
    pub scheduler: Arc<Scheduler>,
    pub events: Arc<dyn EventPublisher>,
    pub config: ServerConfig,
}
