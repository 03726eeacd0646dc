//! SQLite-backed implementations of C1-C3, mirroring the JSON-shaped-column
//! persisted state layout of spec.md §6 (leases in a TTL-capable KV-style
//! table, runs/nodes in relational tables with JSON columns for nested
//! structure).
//!
//! Every implementation wraps a single `rusqlite::Connection` behind a
//! `Mutex` and does its work in `spawn_blocking`, the same pattern
//! `oris-events::sqlite` already uses for the event log.

#![cfg(feature = "sqlite-persistence")]

mod lease_registry;
mod node_registry;
mod run_store;

pub use lease_registry::SqliteLeaseRegistry;
pub use node_registry::SqliteNodeRegistry;
pub use run_store::SqliteRunStore;
