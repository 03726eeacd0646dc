//! C3 Node Registry: node identity, capacity and heartbeat-driven liveness
//! (spec.md §4.3).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oris_kernel::{KernelResult, Node, NodeCapacity, NodeLiveStatus, NodeMetadata};

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Idempotent on node id: re-register replaces metadata/capacity,
    /// resets status to `active` and zeros active-runs.
    async fn register(&self, node_id: &str, metadata: NodeMetadata, capacity: NodeCapacity) -> KernelResult<Node>;

    async fn heartbeat(&self, node_id: &str, status: NodeLiveStatus) -> KernelResult<Option<Node>>;

    async fn list_nodes(&self) -> KernelResult<Vec<Node>>;

    async fn get_node(&self, node_id: &str) -> KernelResult<Option<Node>>;

    async fn delete(&self, node_id: &str) -> KernelResult<bool>;

    /// Nodes whose heartbeat is older than `timeout`; the control plane
    /// reaps (deletes) these under the auxiliary distributed lock.
    async fn reap(&self, timeout: Duration, now: DateTime<Utc>) -> KernelResult<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryNodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    #[tracing::instrument(skip(self, metadata, capacity), fields(node_id = %node_id))]
    async fn register(&self, node_id: &str, metadata: NodeMetadata, capacity: NodeCapacity) -> KernelResult<Node> {
        let node = Node::new(node_id, metadata, capacity, Utc::now());
        self.nodes
            .write()
            .expect("node registry lock poisoned")
            .insert(node_id.to_string(), node.clone());
        metrics::counter!("nodes_registered_total").increment(1);
        Ok(node)
    }

    #[tracing::instrument(skip(self, status), fields(node_id = %node_id))]
    async fn heartbeat(&self, node_id: &str, status: NodeLiveStatus) -> KernelResult<Option<Node>> {
        let mut nodes = self.nodes.write().expect("node registry lock poisoned");
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.status = status;
                node.last_heartbeat = Utc::now();
                Ok(Some(node.clone()))
            }
            None => Ok(None),
        }
    }

    async fn list_nodes(&self) -> KernelResult<Vec<Node>> {
        Ok(self.nodes.read().expect("node registry lock poisoned").values().cloned().collect())
    }

    async fn get_node(&self, node_id: &str) -> KernelResult<Option<Node>> {
        Ok(self.nodes.read().expect("node registry lock poisoned").get(node_id).cloned())
    }

    async fn delete(&self, node_id: &str) -> KernelResult<bool> {
        Ok(self.nodes.write().expect("node registry lock poisoned").remove(node_id).is_some())
    }

    #[tracing::instrument(skip(self, timeout, now))]
    async fn reap(&self, timeout: Duration, now: DateTime<Utc>) -> KernelResult<Vec<String>> {
        let mut nodes = self.nodes.write().expect("node registry lock poisoned");
        let stale: Vec<String> = nodes
            .iter()
            .filter(|(_, n)| now - n.last_heartbeat > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            nodes.remove(id);
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reregister_resets_status_to_active_and_zeroes_active_runs() {
        let registry = InMemoryNodeRegistry::new();
        registry
            .register("n1", NodeMetadata::default(), NodeCapacity { slots: 4, resource_hints: Default::default() })
            .await
            .unwrap();
        registry
            .heartbeat(
                "n1",
                NodeLiveStatus {
                    state: oris_kernel::NodeState::Draining,
                    active_runs: 3,
                    available_slots: 1,
                },
            )
            .await
            .unwrap();

        let node = registry
            .register("n1", NodeMetadata::default(), NodeCapacity { slots: 8, resource_hints: Default::default() })
            .await
            .unwrap();
        assert_eq!(node.status.state, oris_kernel::NodeState::Active);
        assert_eq!(node.status.active_runs, 0);
        assert_eq!(node.capacity.slots, 8);
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_node_returns_none() {
        let registry = InMemoryNodeRegistry::new();
        assert!(registry
            .heartbeat("missing", NodeLiveStatus::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reap_removes_only_stale_nodes() {
        let registry = InMemoryNodeRegistry::new();
        registry
            .register("fresh", NodeMetadata::default(), NodeCapacity { slots: 1, resource_hints: Default::default() })
            .await
            .unwrap();
        registry
            .register("stale", NodeMetadata::default(), NodeCapacity { slots: 1, resource_hints: Default::default() })
            .await
            .unwrap();

        // Force "stale" out of the liveness window.
        {
            let mut nodes = registry.nodes.write().unwrap();
            nodes.get_mut("stale").unwrap().last_heartbeat = Utc::now() - Duration::seconds(120);
        }

        let reaped = registry.reap(Duration::seconds(60), Utc::now()).await.unwrap();
        assert_eq!(reaped, vec!["stale".to_string()]);
        assert!(registry.get_node("fresh").await.unwrap().is_some());
        assert!(registry.get_node("stale").await.unwrap().is_none());
    }
}
