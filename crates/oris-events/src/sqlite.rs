//! SQLite-backed durable event publisher.
//!
//! Append-only table standing in for the "single logical stream" of
//! spec.md §6, with a retention cutoff enforced opportunistically on
//! publish rather than by a background compaction job.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oris_kernel::{Event, KernelError, KernelResult};
use rusqlite::{params, Connection};

pub struct SqliteEventPublisher {
    conn: Arc<Mutex<Connection>>,
    retention: Duration,
    size_cap_rows: u64,
}

impl SqliteEventPublisher {
    pub fn open(path: impl AsRef<std::path::Path>) -> KernelResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| KernelError::transient("opening sqlite event store").with_source(e))?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            // Defaults from spec.md §6: retention >= 7 days, size cap >= 1 GiB.
            // We track the size cap as a row-count proxy since events are small.
            retention: Duration::days(7),
            size_cap_rows: 1_000_000,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

#[async_trait]
impl crate::publisher::EventPublisher for SqliteEventPublisher {
    async fn initialize(&self) -> KernelResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite event store lock poisoned");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS oris_events (
                    event_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    occurred_at_ms INTEGER NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_oris_events_occurred_at
                    ON oris_events(occurred_at_ms);",
            )
        })
        .await
        .map_err(|e| KernelError::fatal("sqlite event store task join failed").with_source(e))?
        .map_err(|e| KernelError::fatal("sqlite event store bootstrap failed").with_source(e))
    }

    async fn publish(&self, event: Event) -> KernelResult<()> {
        let conn = self.conn.clone();
        let retention = self.retention;
        let size_cap_rows = self.size_cap_rows;
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite event store lock poisoned");
            let subject = event.kind.as_subject();
            conn.execute(
                "INSERT OR REPLACE INTO oris_events (event_id, kind, occurred_at_ms, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.event_id.as_str(),
                    subject,
                    event.occurred_at.timestamp_millis(),
                    event.payload.to_string(),
                ],
            )?;

            let cutoff_ms = (Utc::now() - retention).timestamp_millis();
            conn.execute(
                "DELETE FROM oris_events WHERE occurred_at_ms < ?1",
                params![cutoff_ms],
            )?;

            let count: i64 = conn.query_row("SELECT COUNT(*) FROM oris_events", [], |row| row.get(0))?;
            if count as u64 > size_cap_rows {
                let overflow = count as u64 - size_cap_rows;
                conn.execute(
                    "DELETE FROM oris_events WHERE event_id IN (
                        SELECT event_id FROM oris_events ORDER BY occurred_at_ms ASC LIMIT ?1
                    )",
                    params![overflow as i64],
                )?;
            }
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| KernelError::fatal("sqlite event store task join failed").with_source(e))?
        .map_err(|e| {
            tracing::warn!(error = %e, "event publish failed; continuing (best-effort delivery)");
            KernelError::transient("sqlite event publish failed").with_source(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::EventPublisher;
    use oris_kernel::EventKind;

    #[tokio::test]
    async fn initialize_is_idempotent_and_publish_persists() {
        let publisher = SqliteEventPublisher::with_connection(Connection::open_in_memory().unwrap());
        publisher.initialize().await.unwrap();
        publisher.initialize().await.unwrap();
        let event = Event::new(EventKind::AgentDeployed, Utc::now(), serde_json::json!({"agent": "a1"}));
        publisher.publish(event).await.unwrap();

        let conn = publisher.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM oris_events", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn retention_drops_events_older_than_cutoff() {
        let publisher = SqliteEventPublisher::with_connection(Connection::open_in_memory().unwrap())
            .with_retention(Duration::seconds(0));
        publisher.initialize().await.unwrap();
        let old_event = Event::new(
            EventKind::NodeDisconnected,
            Utc::now() - Duration::days(1),
            serde_json::json!({}),
        );
        publisher.publish(old_event).await.unwrap();
        let fresh_event = Event::new(EventKind::NodeDisconnected, Utc::now(), serde_json::json!({}));
        publisher.publish(fresh_event).await.unwrap();

        let conn = publisher.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM oris_events", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
