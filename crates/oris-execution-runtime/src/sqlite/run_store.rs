//! SQLite-backed C2 Run Store: the durable source of truth for run state
//! (spec.md §4.2, §6). `status`/`node id` get their own indexed columns so
//! `ListRuns` filters without a full scan; the rest of the record is
//! JSON-shaped columns per spec.md §6.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use oris_kernel::{
    Costs, ErrorInfo, Event, KernelError, KernelResult, NodeId, Run, RunFilter, RunId, RunPatch,
    RunStatus, Timings,
};
use oris_events::EventPublisher;
use rusqlite::{params, Connection, OptionalExtension};

use crate::run_store::RunStore;

pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Assigned => "assigned",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> rusqlite::Result<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "assigned" => Ok(RunStatus::Assigned),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown run status: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

struct RunRow {
    id: String,
    agent_id: String,
    version: String,
    deployment_id: Option<String>,
    input_ref: String,
    status: String,
    timings: String,
    costs: String,
    error_info: Option<String>,
    trace_id: Option<String>,
    created_at_ms: i64,
    assigned_node_id: Option<String>,
    attempt: u32,
    cancellation_requested: bool,
}

fn row_to_run(r: RunRow) -> rusqlite::Result<Run> {
    let json_err = |e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(Run {
        id: RunId::from(r.id),
        agent_id: r.agent_id,
        version: r.version,
        deployment_id: r.deployment_id,
        input_ref: serde_json::from_str::<BTreeMap<String, String>>(&r.input_ref).map_err(json_err)?,
        status: status_from_str(&r.status)?,
        timings: serde_json::from_str::<Timings>(&r.timings).map_err(json_err)?,
        costs: serde_json::from_str::<Costs>(&r.costs).map_err(json_err)?,
        error_info: r
            .error_info
            .map(|s| serde_json::from_str::<ErrorInfo>(&s))
            .transpose()
            .map_err(json_err)?,
        trace_id: r.trace_id,
        created_at: ms_to_dt(r.created_at_ms),
        assigned_node_id: r.assigned_node_id.map(NodeId::from),
        attempt: r.attempt,
        cancellation_requested: r.cancellation_requested,
    })
}

fn select_row(row: &rusqlite::Row) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        version: row.get(2)?,
        deployment_id: row.get(3)?,
        input_ref: row.get(4)?,
        status: row.get(5)?,
        timings: row.get(6)?,
        costs: row.get(7)?,
        error_info: row.get(8)?,
        trace_id: row.get(9)?,
        created_at_ms: row.get(10)?,
        assigned_node_id: row.get(11)?,
        attempt: row.get(12)?,
        cancellation_requested: row.get::<_, i64>(13)? != 0,
    })
}

const SELECT_COLUMNS: &str = "id, agent_id, version, deployment_id, input_ref, status, timings, costs, \
     error_info, trace_id, created_at_ms, assigned_node_id, attempt, cancellation_requested";

impl SqliteRunStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> KernelResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| KernelError::fatal("opening sqlite run store").with_source(e))?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> KernelResult<Self> {
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            publisher: None,
        })
    }

    pub fn with_connection_and_publisher(
        conn: Connection,
        publisher: Arc<dyn EventPublisher>,
    ) -> KernelResult<Self> {
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            publisher: Some(publisher),
        })
    }

    fn bootstrap(conn: &Connection) -> KernelResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS oris_runs (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                version TEXT NOT NULL,
                deployment_id TEXT,
                input_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                timings TEXT NOT NULL,
                costs TEXT NOT NULL,
                error_info TEXT,
                trace_id TEXT,
                created_at_ms INTEGER NOT NULL,
                assigned_node_id TEXT,
                attempt INTEGER NOT NULL,
                cancellation_requested INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oris_runs_status ON oris_runs(status);
            CREATE INDEX IF NOT EXISTS idx_oris_runs_node ON oris_runs(assigned_node_id);
            CREATE INDEX IF NOT EXISTS idx_oris_runs_agent ON oris_runs(agent_id);",
        )
        .map_err(|e| KernelError::fatal("bootstrapping sqlite run store").with_source(e))
    }

    async fn with_conn<T, F>(&self, f: F) -> KernelResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite run store lock poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| KernelError::fatal("sqlite run store task join failed").with_source(e))?
        .map_err(|e| KernelError::transient("sqlite run store query failed").with_source(e))
    }

    async fn emit(&self, run_id: &RunId, from: RunStatus, to: RunStatus) {
        metrics::counter!("run_transitions_total", "from" => status_to_str(from), "to" => status_to_str(to))
            .increment(1);
        if let Some(publisher) = &self.publisher {
            let event = Event::run_state_changed(run_id.as_str(), from, to, Utc::now());
            if let Err(e) = publisher.publish(event).await {
                tracing::warn!(run_id = %run_id, error = %e, "event publish failed after run transition");
            }
        }
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(
        &self,
        agent_id: &str,
        version: &str,
        input_ref: BTreeMap<String, String>,
    ) -> KernelResult<Run> {
        let run = Run::new(RunId::generate(), agent_id, version, input_ref, Utc::now());
        let to_insert = run.clone();
        self.with_conn(move |conn| {
            let input_ref = serde_json::to_string(&to_insert.input_ref).expect("input_ref always serializes");
            let timings = serde_json::to_string(&to_insert.timings).expect("timings always serializes");
            let costs = serde_json::to_string(&to_insert.costs).expect("costs always serializes");
            conn.execute(
                "INSERT INTO oris_runs
                    (id, agent_id, version, deployment_id, input_ref, status, timings, costs,
                     error_info, trace_id, created_at_ms, assigned_node_id, attempt, cancellation_requested)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, NULL, 0, 0)",
                params![
                    to_insert.id.as_str(),
                    to_insert.agent_id,
                    to_insert.version,
                    to_insert.deployment_id,
                    input_ref,
                    status_to_str(to_insert.status),
                    timings,
                    costs,
                    to_insert.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await?;
        metrics::counter!("runs_created_total").increment(1);
        Ok(run)
    }

    async fn get_run(&self, run_id: &RunId) -> KernelResult<Option<Run>> {
        let run_id = run_id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM oris_runs WHERE id = ?1"),
                params![run_id.as_str()],
                |row| select_row(row).and_then(row_to_run),
            )
            .optional()
        })
        .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> KernelResult<Vec<Run>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM oris_runs"))?;
            let rows = stmt
                .query_map([], |row| select_row(row).and_then(row_to_run))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.into_iter().filter(|r| filter.matches(r)).collect())
        })
        .await
    }

    #[tracing::instrument(skip(self, from_states, patch), fields(run_id = %run_id, to = ?to_state))]
    async fn transition_run(
        &self,
        run_id: &RunId,
        from_states: &[RunStatus],
        to_state: RunStatus,
        patch: RunPatch,
    ) -> KernelResult<Run> {
        let run_id_owned = run_id.clone();
        let from_states = from_states.to_vec();
        let (from, updated) = self
            .with_conn(move |conn| {
                let current = conn
                    .query_row(
                        &format!("SELECT {SELECT_COLUMNS} FROM oris_runs WHERE id = ?1"),
                        params![run_id_owned.as_str()],
                        |row| select_row(row).and_then(row_to_run),
                    )
                    .optional()?;
                let Some(mut run) = current else {
                    return Ok(Err(KernelError::not_found(format!("run not found: {run_id_owned}"))));
                };

                if !from_states.contains(&run.status) || !run.status.can_transition_to(to_state) {
                    return Ok(Err(KernelError::precondition_failed(format!(
                        "cannot transition run {run_id_owned} from {:?} to {:?}",
                        run.status, to_state
                    ))));
                }

                let from = run.status;
                run.status = to_state;
                if let Some(node) = patch.assigned_node_id {
                    run.assigned_node_id = node;
                }
                if let Some(timings) = patch.timings {
                    run.timings = timings;
                }
                if let Some(costs) = patch.costs {
                    run.costs = costs;
                }
                if let Some(error_info) = patch.error_info {
                    run.error_info = error_info;
                }
                if let Some(trace_id) = patch.trace_id {
                    run.trace_id = trace_id;
                }
                if patch.increment_attempt {
                    run.attempt += 1;
                }
                if let Some(flag) = patch.cancellation_requested {
                    run.cancellation_requested = flag;
                }

                let input_ref = serde_json::to_string(&run.input_ref).expect("input_ref always serializes");
                let timings = serde_json::to_string(&run.timings).expect("timings always serializes");
                let costs = serde_json::to_string(&run.costs).expect("costs always serializes");
                let error_info = run
                    .error_info
                    .as_ref()
                    .map(|e| serde_json::to_string(e).expect("error_info always serializes"));

                conn.execute(
                    "UPDATE oris_runs SET
                        status = ?1, input_ref = ?2, timings = ?3, costs = ?4, error_info = ?5,
                        trace_id = ?6, assigned_node_id = ?7, attempt = ?8, cancellation_requested = ?9
                     WHERE id = ?10",
                    params![
                        status_to_str(run.status),
                        input_ref,
                        timings,
                        costs,
                        error_info,
                        run.trace_id,
                        run.assigned_node_id.as_ref().map(|n| n.as_str().to_string()),
                        run.attempt,
                        run.cancellation_requested as i64,
                        run_id_owned.as_str(),
                    ],
                )?;
                Ok(Ok((from, run)))
            })
            .await??;

        self.emit(run_id, from, to_state).await;
        Ok(updated)
    }

    async fn count_by_status(&self) -> KernelResult<BTreeMap<RunStatus, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM oris_runs GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| {
                    let status: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((status, count))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut counts = BTreeMap::new();
            for (status, count) in rows {
                counts.insert(status_from_str(&status)?, count as u64);
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteRunStore {
        SqliteRunStore::with_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn illegal_transition_leaves_state_unchanged() {
        let store = store();
        let run = store.create_run("agent-1", "v1", BTreeMap::new()).await.unwrap();
        let err = store
            .transition_run(&run.id, &[RunStatus::Running], RunStatus::Assigned, RunPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), oris_kernel::ErrorKind::PreconditionFailed);
        let unchanged = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn legal_transition_persists_patch_across_reads() {
        let store = store();
        let run = store.create_run("agent-1", "v1", BTreeMap::new()).await.unwrap();
        let patch = RunPatch {
            assigned_node_id: Some(Some(NodeId::from("node-1"))),
            increment_attempt: true,
            ..Default::default()
        };
        store
            .transition_run(&run.id, &[RunStatus::Pending], RunStatus::Assigned, patch)
            .await
            .unwrap();

        let reloaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Assigned);
        assert_eq!(reloaded.assigned_node_id, Some(NodeId::from("node-1")));
        assert_eq!(reloaded.attempt, 1);
    }

    #[tokio::test]
    async fn list_runs_filters_by_status() {
        let store = store();
        let r1 = store.create_run("a1", "v1", BTreeMap::new()).await.unwrap();
        let _r2 = store.create_run("a1", "v1", BTreeMap::new()).await.unwrap();
        store
            .transition_run(&r1.id, &[RunStatus::Pending], RunStatus::Assigned, RunPatch::default())
            .await
            .unwrap();

        let assigned = store
            .list_runs(&RunFilter { status: Some(RunStatus::Assigned), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, r1.id);
    }
}
