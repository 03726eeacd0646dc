//! `oris-control-plane` binary: wires the lease registry (C1), run store
//! (C2), node registry (C3), scheduler (C4), lease stream + REST service
//! (C5), event publisher (C6) and metrics surface (C8) into one HTTP
//! server (spec.md §2).
//!
//! Run with:
//!   cargo run -p oris-control-plane --features sqlite-persistence

mod config;
mod reaper;

use std::sync::Arc;

use anyhow::Context;
use oris_events::EventPublisher;
use oris_execution_runtime::{DistributedLock, InMemoryDistributedLock, InMemoryLeaseRegistry, InMemoryNodeRegistry, InMemoryRunStore, LeaseRegistry, NodeRegistry, RunStore, Scheduler, SchedulerConfig};
use oris_execution_server::{build_router, AppState, ServerConfig};

use crate::config::Config;

#[cfg(feature = "sqlite-persistence")]
use oris_execution_runtime::{SqliteLeaseRegistry, SqliteNodeRegistry, SqliteRunStore};
#[cfg(feature = "sqlite-persistence")]
use oris_events::SqliteEventPublisher;

fn install_metrics_recorder(addr: &str) {
    match addr.parse() {
        Ok(socket_addr) => {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(socket_addr);
            if let Err(e) = builder.install() {
                tracing::warn!(error = %e, "failed to install prometheus metrics recorder, continuing without one");
            } else {
                tracing::info!(%addr, "prometheus metrics exporter listening");
            }
        }
        Err(e) => {
            tracing::warn!(%addr, error = %e, "invalid ORIS_METRICS_ADDR, metrics recorder not installed");
        }
    }
}

/// Builds the store trio. Durable (SQLite) backends are used whenever
/// `ORIS_SQLITE_DB` is set and the `sqlite-persistence` feature is
/// compiled in; otherwise every store is the in-memory reference
/// implementation, which is enough to drive the whole system end to end
/// in a single process (tests and local demos).
fn build_stores(
    cfg: &Config,
) -> anyhow::Result<(Arc<dyn LeaseRegistry>, Arc<dyn NodeRegistry>, Arc<dyn RunStore>)> {
    #[cfg(feature = "sqlite-persistence")]
    if cfg.persistence_enabled() {
        let leases = Arc::new(
            SqliteLeaseRegistry::open(&cfg.sqlite_db).context("opening sqlite lease registry")?,
        ) as Arc<dyn LeaseRegistry>;
        let nodes = Arc::new(
            SqliteNodeRegistry::open(&cfg.sqlite_db).context("opening sqlite node registry")?,
        ) as Arc<dyn NodeRegistry>;
        let runs = Arc::new(
            SqliteRunStore::open(&cfg.sqlite_db).context("opening sqlite run store")?,
        ) as Arc<dyn RunStore>;
        return Ok((leases, nodes, runs));
    }
    let _ = cfg;
    Ok((
        Arc::new(InMemoryLeaseRegistry::new()),
        Arc::new(InMemoryNodeRegistry::new()),
        Arc::new(InMemoryRunStore::new()),
    ))
}

fn build_event_publisher(cfg: &Config) -> anyhow::Result<Arc<dyn EventPublisher>> {
    #[cfg(feature = "sqlite-persistence")]
    if cfg.persistence_enabled() {
        let path = cfg.events_sqlite_db.clone().unwrap_or_else(|| cfg.sqlite_db.clone());
        return Ok(Arc::new(SqliteEventPublisher::open(path).context("opening sqlite event publisher")?));
    }
    let _ = cfg;
    Ok(Arc::new(oris_events::InMemoryEventPublisher::default()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env();
    install_metrics_recorder(&cfg.metrics_addr);

    let (lease_registry, node_registry, run_store) = build_stores(&cfg)?;
    let events = build_event_publisher(&cfg)?;

    // Best-effort: a durable bus that is unreachable at boot must not
    // block serving (SPEC_FULL §10 open-question resolution 3).
    if let Err(e) = events.initialize().await {
        tracing::warn!(error = %e, "event publisher initialize failed; continuing without durable events");
    }

    let scheduler = Arc::new(Scheduler::new(
        lease_registry.clone(),
        node_registry.clone(),
        run_store.clone(),
        SchedulerConfig {
            lease_ttl: cfg.lease_default_ttl,
            heartbeat_timeout: cfg.heartbeat_timeout,
        },
    ));

    let dist_lock: Arc<dyn DistributedLock> = Arc::new(InMemoryDistributedLock::new());
    let reaper_owner = uuid::Uuid::new_v4().to_string();

    tokio::spawn(reaper::run_reaper(
        node_registry.clone(),
        dist_lock.clone(),
        reaper_owner,
        cfg.heartbeat_timeout,
        cfg.reaper_interval,
    ));
    tokio::spawn(reaper::run_scheduler_sweep(
        run_store.clone(),
        scheduler.clone(),
        cfg.scheduler_sweep_interval,
    ));
    tokio::spawn(reaper::run_metrics_sampler(
        node_registry.clone(),
        run_store.clone(),
        lease_registry.clone(),
        cfg.metrics_sample_interval,
    ));

    let state = AppState {
        lease_registry,
        node_registry,
        run_store,
        scheduler,
        events,
        config: ServerConfig {
            lease_default_ttl: cfg.lease_default_ttl,
            max_attempts: cfg.max_attempts,
            pull_poll_interval: cfg.pull_poll_interval,
        },
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("binding {}", cfg.server_addr))?;
    tracing::info!(addr = %cfg.server_addr, "oris control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

/// Bounded-grace shutdown (spec.md §5): stop accepting new work on SIGINT
/// and let axum drain in-flight handlers before the process exits.
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining in-flight requests");
}
