//! Cross-backend property tests: the same contract exercised against every
//! `LeaseRegistry`/`RunStore` implementation, generalizing the teacher's
//! `postgres_runtime_repository.rs` practice of running one behavioral
//! harness against multiple storage backends.

use std::sync::Arc;

use chrono::Duration;
use oris_kernel::{NodeId, RunPatch, RunStatus};

use crate::lease_registry::LeaseRegistry;
use crate::run_store::RunStore;

/// spec.md §8 property 1: at most one active lease per run id, across
/// whichever `LeaseRegistry` implementation is passed in.
async fn exactly_one_active_lease_wins(registry: Arc<dyn LeaseRegistry>) {
    let run_id = oris_kernel::RunId::from("contract-run-1");
    let winner = registry
        .acquire_lease(&run_id, &NodeId::from("node-a"), Duration::seconds(30))
        .await
        .unwrap();
    let loser = registry
        .acquire_lease(&run_id, &NodeId::from("node-b"), Duration::seconds(30))
        .await
        .unwrap();
    assert!(winner);
    assert!(!loser);
}

/// spec.md §8 round-trip law: acquire, release, reacquire all succeed.
async fn acquire_release_reacquire(registry: Arc<dyn LeaseRegistry>) {
    let run_id = oris_kernel::RunId::from("contract-run-2");
    assert!(registry
        .acquire_lease(&run_id, &NodeId::from("node-a"), Duration::seconds(30))
        .await
        .unwrap());
    assert!(registry.release_lease(&run_id).await.unwrap());
    assert!(registry
        .acquire_lease(&run_id, &NodeId::from("node-b"), Duration::seconds(30))
        .await
        .unwrap());
}

/// spec.md §8 property 4: illegal transitions fail and leave state unchanged.
async fn illegal_transition_is_rejected(store: Arc<dyn RunStore>) {
    let run = store.create_run("agent-1", "v1", Default::default()).await.unwrap();
    let err = store
        .transition_run(&run.id, &[RunStatus::Running], RunStatus::Completed, RunPatch::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), oris_kernel::ErrorKind::PreconditionFailed);
    let reloaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, RunStatus::Pending);
}

/// spec.md §8 property 2: once terminal, a run never gets another lease.
async fn terminal_run_never_gets_another_lease(store: Arc<dyn RunStore>, registry: Arc<dyn LeaseRegistry>) {
    let run = store.create_run("agent-1", "v1", Default::default()).await.unwrap();
    store
        .transition_run(&run.id, &[RunStatus::Pending], RunStatus::Cancelled, RunPatch::default())
        .await
        .unwrap();
    registry.release_lease(&run.id).await.unwrap();
    let reloaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert!(reloaded.status.is_terminal());
    assert!(!reloaded.status.can_transition_to(RunStatus::Assigned));
}

#[tokio::test]
async fn in_memory_lease_registry_satisfies_contract() {
    let registry: Arc<dyn LeaseRegistry> = Arc::new(crate::lease_registry::InMemoryLeaseRegistry::new());
    exactly_one_active_lease_wins(registry.clone()).await;
    acquire_release_reacquire(registry).await;
}

#[tokio::test]
async fn in_memory_run_store_satisfies_contract() {
    let store: Arc<dyn RunStore> = Arc::new(crate::run_store::InMemoryRunStore::new());
    let registry: Arc<dyn LeaseRegistry> = Arc::new(crate::lease_registry::InMemoryLeaseRegistry::new());
    illegal_transition_is_rejected(store.clone()).await;
    terminal_run_never_gets_another_lease(store, registry).await;
}

#[cfg(feature = "sqlite-persistence")]
#[tokio::test]
async fn sqlite_lease_registry_satisfies_contract() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    let registry: Arc<dyn LeaseRegistry> = Arc::new(crate::sqlite::SqliteLeaseRegistry::with_connection(conn).unwrap());
    exactly_one_active_lease_wins(registry.clone()).await;
    acquire_release_reacquire(registry).await;
}

#[cfg(feature = "sqlite-persistence")]
#[tokio::test]
async fn sqlite_run_store_satisfies_contract() {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    let store: Arc<dyn RunStore> = Arc::new(crate::sqlite::SqliteRunStore::with_connection(conn).unwrap());
    let registry: Arc<dyn LeaseRegistry> = Arc::new(crate::lease_registry::InMemoryLeaseRegistry::new());
    illegal_transition_is_rejected(store.clone()).await;
    terminal_run_never_gets_another_lease(store, registry).await;
}
