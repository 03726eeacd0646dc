//! Postgres-backed durable event publisher.
//!
//! Mirrors `oris-execution-runtime`'s schema-bootstrap style
//! (see `postgres_runtime_repository.rs` in the kernel-postgres teacher
//! crate this workspace descends from) but async-native throughout,
//! since our traits are `async_trait` rather than blocking.

#![cfg(feature = "kernel-postgres")]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oris_kernel::{Event, KernelError, KernelResult};
use sqlx::PgPool;
use tokio::sync::OnceCell;

pub struct PostgresEventPublisher {
    pool: PgPool,
    schema: String,
    retention: Duration,
    size_cap_rows: i64,
    schema_ready: OnceCell<()>,
}

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty() && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn map_err(prefix: &str, e: sqlx::Error) -> KernelError {
    KernelError::transient(format!("{prefix}: {e}")).with_source(e)
}

impl PostgresEventPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            retention: Duration::days(7),
            size_cap_rows: 1_000_000,
            schema_ready: OnceCell::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    async fn ensure_schema(&self) -> KernelResult<()> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(KernelError::fatal(format!("invalid schema name: {}", self.schema)));
        }
        self.schema_ready
            .get_or_try_init(|| async {
                let create_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema);
                let create_table = format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\".oris_events (
                        event_id TEXT PRIMARY KEY,
                        kind TEXT NOT NULL,
                        occurred_at TIMESTAMPTZ NOT NULL,
                        payload JSONB NOT NULL
                    )",
                    self.schema
                );
                let create_index = format!(
                    "CREATE INDEX IF NOT EXISTS idx_oris_events_occurred_at
                     ON \"{}\".oris_events(occurred_at)",
                    self.schema
                );
                sqlx::query(&create_schema)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_err("create schema", e))?;
                sqlx::query(&create_table)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_err("create table", e))?;
                sqlx::query(&create_index)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_err("create index", e))?;
                Ok::<(), KernelError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl crate::publisher::EventPublisher for PostgresEventPublisher {
    async fn initialize(&self) -> KernelResult<()> {
        self.ensure_schema().await
    }

    async fn publish(&self, event: Event) -> KernelResult<()> {
        self.ensure_schema().await?;

        let insert_sql = format!(
            "INSERT INTO \"{}\".oris_events (event_id, kind, occurred_at, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (event_id) DO NOTHING",
            self.schema
        );
        sqlx::query(&insert_sql)
            .bind(event.event_id.as_str())
            .bind(event.kind.as_subject())
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("insert event", e))?;

        let cutoff = Utc::now() - self.retention;
        let delete_sql = format!("DELETE FROM \"{}\".oris_events WHERE occurred_at < $1", self.schema);
        sqlx::query(&delete_sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("retention sweep", e))?;

        let count_sql = format!("SELECT COUNT(*) FROM \"{}\".oris_events", self.schema);
        let count: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err("count events", e))?;
        if count > self.size_cap_rows {
            let overflow = count - self.size_cap_rows;
            let prune_sql = format!(
                "DELETE FROM \"{}\".oris_events WHERE event_id IN (
                    SELECT event_id FROM \"{}\".oris_events ORDER BY occurred_at ASC LIMIT $1
                )",
                self.schema, self.schema
            );
            sqlx::query(&prune_sql)
                .bind(overflow)
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("size cap sweep", e))?;
        }
        Ok(())
    }
}
