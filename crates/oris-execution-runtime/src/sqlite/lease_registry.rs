//! SQLite-backed C1 Lease Registry. Leases are a TTL-capable KV store in
//! spirit (spec.md §6): one row per run id, expiry checked at read time so
//! physical removal lagging behind expiry never surfaces a stale lease.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use oris_kernel::{KernelError, KernelResult, Lease, LeaseId, NodeId, RunId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::lease_registry::LeaseRegistry;

pub struct SqliteLeaseRegistry {
    conn: Arc<Mutex<Connection>>,
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_lease(run_id: String, lease_id: String, holder: String, acquired_ms: i64, expires_ms: i64) -> Lease {
    Lease {
        run_id: RunId::from(run_id),
        lease_id: LeaseId::from(lease_id),
        holder_node_id: NodeId::from(holder),
        acquired_at: ms_to_dt(acquired_ms),
        expires_at: ms_to_dt(expires_ms),
    }
}

impl SqliteLeaseRegistry {
    pub fn open(path: impl AsRef<std::path::Path>) -> KernelResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| KernelError::fatal("opening sqlite lease store").with_source(e))?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> KernelResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS oris_leases (
                run_id TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                holder_node_id TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );",
        )
        .map_err(|e| KernelError::fatal("bootstrapping sqlite lease store").with_source(e))?;
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
            let conn = conn.lock().expect("sqlite lease store lock poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| KernelError::fatal("sqlite lease store task join failed").with_source(e))?
        .map_err(|e| KernelError::transient("sqlite lease store query failed").with_source(e))
    }
}

#[async_trait]
impl LeaseRegistry for SqliteLeaseRegistry {
    #[tracing::instrument(skip(self, ttl), fields(run_id = %run_id, node_id = %node_id))]
    async fn acquire_lease(&self, run_id: &RunId, node_id: &NodeId, ttl: Duration) -> KernelResult<bool> {
        let run_id = run_id.clone();
        let node_id = node_id.clone();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT expires_at_ms FROM oris_leases WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(expires_ms) = existing {
                if ms_to_dt(expires_ms) > now {
                    return Ok(false);
                }
            }
            let lease_id = LeaseId::generate();
            let expires_at = now + ttl;
            conn.execute(
                "INSERT INTO oris_leases (run_id, lease_id, holder_node_id, acquired_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id) DO UPDATE SET
                    lease_id = excluded.lease_id,
                    holder_node_id = excluded.holder_node_id,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms",
                params![
                    run_id.as_str(),
                    lease_id.as_str(),
                    node_id.as_str(),
                    now.timestamp_millis(),
                    expires_at.timestamp_millis(),
                ],
            )?;
            Ok(true)
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    async fn release_lease(&self, run_id: &RunId) -> KernelResult<bool> {
        let run_id = run_id.clone();
        self.with_conn(move |conn| {
            let affected = conn.execute("DELETE FROM oris_leases WHERE run_id = ?1", params![run_id.as_str()])?;
            Ok(affected > 0)
        })
        .await
    }

    async fn get_lease(&self, run_id: &RunId) -> KernelResult<Option<Lease>> {
        let run_id = run_id.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT run_id, lease_id, holder_node_id, acquired_at_ms, expires_at_ms
                     FROM oris_leases WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.and_then(|(run_id, lease_id, holder, acquired_ms, expires_ms)| {
                let lease = row_to_lease(run_id, lease_id, holder, acquired_ms, expires_ms);
                (!lease.is_expired(Utc::now())).then_some(lease)
            }))
        })
        .await
    }

    #[tracing::instrument(skip(self, additional), fields(run_id = %run_id))]
    async fn extend_lease(&self, run_id: &RunId, additional: Duration) -> KernelResult<bool> {
        let run_id = run_id.clone();
        self.with_conn(move |conn| {
            let now = Utc::now();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT expires_at_ms FROM oris_leases WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(expires_ms) if ms_to_dt(expires_ms) > now => {
                    let new_expiry = ms_to_dt(expires_ms) + additional;
                    conn.execute(
                        "UPDATE oris_leases SET expires_at_ms = ?1 WHERE run_id = ?2",
                        params![new_expiry.timestamp_millis(), run_id.as_str()],
                    )?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn list_active(&self, now: DateTime<Utc>) -> KernelResult<Vec<Lease>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, lease_id, holder_node_id, acquired_at_ms, expires_at_ms
                 FROM oris_leases WHERE expires_at_ms > ?1",
            )?;
            let rows = stmt
                .query_map(params![now.timestamp_millis()], |row| {
                    Ok(row_to_lease(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteLeaseRegistry {
        SqliteLeaseRegistry::with_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn acquire_release_reacquire_round_trips() {
        let reg = store();
        let run = RunId::from("r1");
        assert!(reg.acquire_lease(&run, &NodeId::from("n1"), Duration::seconds(30)).await.unwrap());
        assert!(!reg.acquire_lease(&run, &NodeId::from("n2"), Duration::seconds(30)).await.unwrap());
        assert!(reg.release_lease(&run).await.unwrap());
        assert!(reg.acquire_lease(&run, &NodeId::from("n2"), Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_invisible_and_reacquirable() {
        let reg = store();
        let run = RunId::from("r1");
        assert!(reg
            .acquire_lease(&run, &NodeId::from("n1"), Duration::milliseconds(-1))
            .await
            .unwrap());
        assert!(reg.get_lease(&run).await.unwrap().is_none());
        assert!(reg.acquire_lease(&run, &NodeId::from("n2"), Duration::seconds(30)).await.unwrap());
    }
}
