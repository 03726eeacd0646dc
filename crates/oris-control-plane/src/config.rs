//! Environment-variable-driven configuration (spec.md §6 "Environment /
//! configuration surface"), matching the teacher's `ORIS_*` convention
//! (`ORIS_SQLITE_DB`, `ORIS_SERVER_ADDR` in `execution_server.rs`).

use std::time::Duration as StdDuration;

use chrono::Duration;

/// Everything the control-plane binary needs at startup; every field has a
/// documented default so the binary runs out of the box in a single
/// process with in-memory stores.
#[derive(Clone, Debug)]
pub struct Config {
    /// `ORIS_SERVER_ADDR` — address the HTTP server binds to.
    pub server_addr: String,
    /// `ORIS_SQLITE_DB` — path to the SQLite database backing runs, nodes
    /// and leases. Empty string keeps everything in memory.
    pub sqlite_db: String,
    /// `ORIS_EVENTS_SQLITE_DB` — optional separate SQLite file for the
    /// event log; defaults to `sqlite_db` when persistence is enabled.
    pub events_sqlite_db: Option<String>,
    /// `ORIS_LEASE_DEFAULT_TTL_SECONDS`
    pub lease_default_ttl: Duration,
    /// `ORIS_HEARTBEAT_TIMEOUT_SECONDS` — liveness window (spec.md §4.3 default 60s).
    pub heartbeat_timeout: Duration,
    /// `ORIS_MAX_ATTEMPTS` — retry cap (spec.md §4.5 default 3).
    pub max_attempts: u32,
    /// `ORIS_PULL_POLL_INTERVAL_MS` — Pull stream idle poll cadence (spec.md §4.5 default 2s).
    pub pull_poll_interval: StdDuration,
    /// `ORIS_SCHEDULER_SWEEP_INTERVAL_MS` — cadence of the background sweep
    /// that (re)schedules pending runs (SPEC_FULL §5).
    pub scheduler_sweep_interval: StdDuration,
    /// `ORIS_REAPER_INTERVAL_SECONDS` — cadence of the node-heartbeat reaper.
    pub reaper_interval: StdDuration,
    /// `ORIS_METRICS_ADDR` — address the Prometheus exporter listens on.
    pub metrics_addr: String,
    /// `ORIS_METRICS_SAMPLE_INTERVAL_MS` — cadence of the C8 gauge sampler
    /// (node load, run counts by status, active lease count).
    pub metrics_sample_interval: StdDuration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_addr: env_or("ORIS_SERVER_ADDR", "127.0.0.1:8080"),
            sqlite_db: env_or("ORIS_SQLITE_DB", ""),
            events_sqlite_db: std::env::var("ORIS_EVENTS_SQLITE_DB").ok(),
            lease_default_ttl: Duration::seconds(env_parse("ORIS_LEASE_DEFAULT_TTL_SECONDS", 30)),
            heartbeat_timeout: Duration::seconds(env_parse("ORIS_HEARTBEAT_TIMEOUT_SECONDS", 60)),
            max_attempts: env_parse("ORIS_MAX_ATTEMPTS", 3),
            pull_poll_interval: StdDuration::from_millis(env_parse("ORIS_PULL_POLL_INTERVAL_MS", 2000)),
            scheduler_sweep_interval: StdDuration::from_millis(env_parse("ORIS_SCHEDULER_SWEEP_INTERVAL_MS", 1000)),
            reaper_interval: StdDuration::from_secs(env_parse("ORIS_REAPER_INTERVAL_SECONDS", 30)),
            metrics_addr: env_or("ORIS_METRICS_ADDR", "127.0.0.1:9090"),
            metrics_sample_interval: StdDuration::from_millis(env_parse("ORIS_METRICS_SAMPLE_INTERVAL_MS", 5000)),
        }
    }

    /// Whether durable (SQLite) persistence should be wired up, vs. the
    /// in-memory stores used for tests and quick single-process demos.
    pub fn persistence_enabled(&self) -> bool {
        !self.sqlite_db.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env_vars() {
        // Exercises the parsing path directly rather than mutating
        // process-wide env vars, which would race with other tests.
        let cfg = Config {
            server_addr: env_or("ORIS_SERVER_ADDR_DOES_NOT_EXIST", "127.0.0.1:8080"),
            sqlite_db: env_or("ORIS_SQLITE_DB_DOES_NOT_EXIST", ""),
            events_sqlite_db: None,
            lease_default_ttl: Duration::seconds(30),
            heartbeat_timeout: Duration::seconds(60),
            max_attempts: 3,
            pull_poll_interval: StdDuration::from_millis(2000),
            scheduler_sweep_interval: StdDuration::from_millis(1000),
            reaper_interval: StdDuration::from_secs(30),
            metrics_addr: env_or("ORIS_METRICS_ADDR_DOES_NOT_EXIST", "127.0.0.1:9090"),
            metrics_sample_interval: StdDuration::from_millis(5000),
        };
        assert_eq!(cfg.server_addr, "127.0.0.1:8080");
        assert!(!cfg.persistence_enabled());
        assert_eq!(cfg.max_attempts, 3);
    }
}
