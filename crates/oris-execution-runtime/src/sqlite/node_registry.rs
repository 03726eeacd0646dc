//! SQLite-backed C3 Node Registry. Metadata/capacity/status are stored as
//! JSON columns (spec.md §6); liveness logic itself lives on `Node` in
//! `oris-kernel` so it is shared with the in-memory implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use oris_kernel::{KernelError, KernelResult, Node, NodeCapacity, NodeLiveStatus, NodeMetadata};
use rusqlite::{params, Connection, OptionalExtension};

use crate::node_registry::NodeRegistry;

pub struct SqliteNodeRegistry {
    conn: Arc<Mutex<Connection>>,
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_node(
    node_id: String,
    metadata: String,
    capacity: String,
    status: String,
    last_heartbeat_ms: i64,
) -> rusqlite::Result<Node> {
    let metadata: NodeMetadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let capacity: NodeCapacity = serde_json::from_str(&capacity)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let status: NodeLiveStatus = serde_json::from_str(&status)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Node {
        node_id,
        metadata,
        capacity,
        status,
        last_heartbeat: ms_to_dt(last_heartbeat_ms),
    })
}

impl SqliteNodeRegistry {
    pub fn open(path: impl AsRef<std::path::Path>) -> KernelResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| KernelError::fatal("opening sqlite node store").with_source(e))?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> KernelResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS oris_nodes (
                node_id TEXT PRIMARY KEY,
                metadata TEXT NOT NULL,
                capacity TEXT NOT NULL,
                status TEXT NOT NULL,
                last_heartbeat_ms INTEGER NOT NULL
            );",
        )
        .map_err(|e| KernelError::fatal("bootstrapping sqlite node store").with_source(e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> KernelResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite node store lock poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| KernelError::fatal("sqlite node store task join failed").with_source(e))?
        .map_err(|e| KernelError::transient("sqlite node store query failed").with_source(e))
    }
}

#[async_trait]
impl NodeRegistry for SqliteNodeRegistry {
    #[tracing::instrument(skip(self, metadata, capacity), fields(node_id = %node_id))]
    async fn register(&self, node_id: &str, metadata: NodeMetadata, capacity: NodeCapacity) -> KernelResult<Node> {
        let node = Node::new(node_id, metadata, capacity, Utc::now());
        let to_insert = node.clone();
        self.with_conn(move |conn| {
            let metadata = serde_json::to_string(&to_insert.metadata).expect("metadata always serializes");
            let capacity = serde_json::to_string(&to_insert.capacity).expect("capacity always serializes");
            let status = serde_json::to_string(&to_insert.status).expect("status always serializes");
            conn.execute(
                "INSERT INTO oris_nodes (node_id, metadata, capacity, status, last_heartbeat_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(node_id) DO UPDATE SET
                    metadata = excluded.metadata,
                    capacity = excluded.capacity,
                    status = excluded.status,
                    last_heartbeat_ms = excluded.last_heartbeat_ms",
                params![
                    to_insert.node_id,
                    metadata,
                    capacity,
                    status,
                    to_insert.last_heartbeat.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await?;
        metrics::counter!("nodes_registered_total").increment(1);
        Ok(node)
    }

    #[tracing::instrument(skip(self, status), fields(node_id = %node_id))]
    async fn heartbeat(&self, node_id: &str, status: NodeLiveStatus) -> KernelResult<Option<Node>> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let existing = conn
                .query_row(
                    "SELECT node_id, metadata, capacity, status, last_heartbeat_ms FROM oris_nodes WHERE node_id = ?1",
                    params![node_id],
                    |row| {
                        row_to_node(
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        )
                    },
                )
                .optional()?;
            let Some(mut node) = existing else {
                return Ok(None);
            };
            node.status = status;
            node.last_heartbeat = now;
            let status_json = serde_json::to_string(&node.status).expect("status always serializes");
            conn.execute(
                "UPDATE oris_nodes SET status = ?1, last_heartbeat_ms = ?2 WHERE node_id = ?3",
                params![status_json, now.timestamp_millis(), node_id],
            )?;
            Ok(Some(node))
        })
        .await
    }

    async fn list_nodes(&self) -> KernelResult<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT node_id, metadata, capacity, status, last_heartbeat_ms FROM oris_nodes")?;
            let rows = stmt
                .query_map([], |row| {
                    row_to_node(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_node(&self, node_id: &str) -> KernelResult<Option<Node>> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT node_id, metadata, capacity, status, last_heartbeat_ms FROM oris_nodes WHERE node_id = ?1",
                params![node_id],
                |row| row_to_node(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, node_id: &str) -> KernelResult<bool> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let affected = conn.execute("DELETE FROM oris_nodes WHERE node_id = ?1", params![node_id])?;
            Ok(affected > 0)
        })
        .await
    }

    #[tracing::instrument(skip(self, timeout, now))]
    async fn reap(&self, timeout: Duration, now: DateTime<Utc>) -> KernelResult<Vec<String>> {
        self.with_conn(move |conn| {
            let cutoff_ms = (now - timeout).timestamp_millis();
            let mut stmt = conn.prepare("SELECT node_id FROM oris_nodes WHERE last_heartbeat_ms < ?1")?;
            let stale: Vec<String> = stmt
                .query_map(params![cutoff_ms], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            conn.execute("DELETE FROM oris_nodes WHERE last_heartbeat_ms < ?1", params![cutoff_ms])?;
            Ok(stale)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oris_kernel::NodeState;
    use std::collections::BTreeMap;

    fn registry() -> SqliteNodeRegistry {
        SqliteNodeRegistry::with_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn reregister_resets_status_to_active() {
        let registry = registry();
        registry
            .register("n1", NodeMetadata::default(), NodeCapacity { slots: 4, resource_hints: BTreeMap::new() })
            .await
            .unwrap();
        registry
            .heartbeat(
                "n1",
                NodeLiveStatus { state: NodeState::Draining, active_runs: 3, available_slots: 1 },
            )
            .await
            .unwrap();
        let node = registry
            .register("n1", NodeMetadata::default(), NodeCapacity { slots: 8, resource_hints: BTreeMap::new() })
            .await
            .unwrap();
        assert_eq!(node.status.state, NodeState::Active);
        assert_eq!(node.status.active_runs, 0);
    }

    #[tokio::test]
    async fn reap_ignores_nodes_within_the_heartbeat_window() {
        let registry = registry();
        registry
            .register("fresh", NodeMetadata::default(), NodeCapacity { slots: 1, resource_hints: BTreeMap::new() })
            .await
            .unwrap();
        let reaped = registry.reap(Duration::seconds(60), Utc::now()).await.unwrap();
        assert!(reaped.is_empty());
        assert!(registry.get_node("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reap_removes_nodes_past_the_heartbeat_cutoff() {
        let registry = registry();
        registry
            .register("stale", NodeMetadata::default(), NodeCapacity { slots: 1, resource_hints: BTreeMap::new() })
            .await
            .unwrap();
        let future = Utc::now() + Duration::seconds(120);
        let reaped = registry.reap(Duration::seconds(60), future).await.unwrap();
        assert_eq!(reaped, vec!["stale".to_string()]);
        assert!(registry.get_node("stale").await.unwrap().is_none());
    }
}
