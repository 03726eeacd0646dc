//! State-change events fanned out to the durable bus (spec.md §3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::EventId;
use crate::run::RunStatus;

/// Stable string discriminators (spec.md §4.8); kept as an enum so producers
/// can't typo a subject, with `as_subject` giving the wire string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStateChanged,
    NodeRegistered,
    NodeHeartbeat,
    NodeDisconnected,
    AgentDeployed,
}

impl EventKind {
    pub fn as_subject(self) -> &'static str {
        match self {
            EventKind::RunStateChanged => "events.run.state.changed",
            EventKind::NodeRegistered => "events.node.registered",
            EventKind::NodeHeartbeat => "events.node.heartbeat",
            EventKind::NodeDisconnected => "events.node.disconnected",
            EventKind::AgentDeployed => "events.agent.deployed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, occurred_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            event_id: EventId::generate(),
            kind,
            occurred_at,
            payload,
        }
    }

    pub fn run_state_changed(
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            EventKind::RunStateChanged,
            occurred_at,
            serde_json::json!({
                "run_id": run_id,
                "from": from,
                "to": to,
            }),
        )
    }

    pub fn node_registered(node_id: &str, occurred_at: DateTime<Utc>) -> Self {
        Self::new(EventKind::NodeRegistered, occurred_at, serde_json::json!({ "node_id": node_id }))
    }

    pub fn node_heartbeat(node_id: &str, occurred_at: DateTime<Utc>) -> Self {
        Self::new(EventKind::NodeHeartbeat, occurred_at, serde_json::json!({ "node_id": node_id }))
    }

    pub fn node_disconnected(node_id: &str, occurred_at: DateTime<Utc>) -> Self {
        Self::new(EventKind::NodeDisconnected, occurred_at, serde_json::json!({ "node_id": node_id }))
    }
}
