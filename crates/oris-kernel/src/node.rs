//! Worker node identity, capacity and liveness (spec.md §3, §4.3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Draining,
    Offline,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeMetadata {
    pub region: Option<String>,
    pub environment: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeCapacity {
    pub slots: u32,
    pub resource_hints: BTreeMap<String, String>,
}

/// Live, self-reported snapshot refreshed by heartbeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeLiveStatus {
    pub state: NodeState,
    pub active_runs: u32,
    pub available_slots: u32,
}

impl Default for NodeLiveStatus {
    fn default() -> Self {
        Self {
            state: NodeState::Active,
            active_runs: 0,
            available_slots: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub node_id: String,
    pub metadata: NodeMetadata,
    pub capacity: NodeCapacity,
    pub status: NodeLiveStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        metadata: NodeMetadata,
        capacity: NodeCapacity,
        now: DateTime<Utc>,
    ) -> Self {
        let available_slots = capacity.slots;
        Self {
            node_id: node_id.into(),
            metadata,
            capacity,
            status: NodeLiveStatus {
                state: NodeState::Active,
                active_runs: 0,
                available_slots,
            },
            last_heartbeat: now,
        }
    }

    /// Liveness policy (spec.md §4.3): active state and a fresh heartbeat.
    pub fn is_live(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        self.status.state == NodeState::Active && now - self.last_heartbeat <= heartbeat_timeout
    }

    /// Draining nodes stay live for run completion but are never scheduling targets.
    pub fn is_schedulable(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        self.is_live(now, heartbeat_timeout) && self.status.available_slots > 0
    }

    pub fn load_fraction(&self) -> f64 {
        if self.capacity.slots == 0 {
            return 1.0;
        }
        self.status.active_runs as f64 / self.capacity.slots as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(slots: u32, active: u32, available: u32) -> Node {
        let mut n = Node::new(
            "n1",
            NodeMetadata::default(),
            NodeCapacity {
                slots,
                resource_hints: BTreeMap::new(),
            },
            Utc::now(),
        );
        n.status.active_runs = active;
        n.status.available_slots = available;
        n
    }

    #[test]
    fn draining_nodes_are_live_but_not_schedulable() {
        let mut n = node(4, 1, 3);
        n.status.state = NodeState::Draining;
        assert!(n.is_live(Utc::now(), chrono::Duration::seconds(60)));
        assert!(!n.is_schedulable(Utc::now(), chrono::Duration::seconds(60)));
    }

    #[test]
    fn stale_heartbeat_is_not_live() {
        let mut n = node(4, 0, 4);
        n.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        assert!(!n.is_live(Utc::now(), chrono::Duration::seconds(60)));
    }

    #[test]
    fn load_fraction_handles_zero_slots() {
        let n = node(0, 0, 0);
        assert_eq!(n.load_fraction(), 1.0);
    }
}
