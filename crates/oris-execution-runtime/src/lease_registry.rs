//! C1 Lease Registry: at-most-one active lease per run, TTL-authoritative
//! (spec.md §4.1).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oris_kernel::{KernelResult, Lease, LeaseId, NodeId, RunId};

#[async_trait]
pub trait LeaseRegistry: Send + Sync {
    /// Succeeds only if no active (non-expired) lease exists for `run_id`.
    async fn acquire_lease(&self, run_id: &RunId, node_id: &NodeId, ttl: Duration) -> KernelResult<bool>;

    /// Unconditionally removes any active lease for `run_id`.
    async fn release_lease(&self, run_id: &RunId) -> KernelResult<bool>;

    /// Returns the lease iff present and not expired.
    async fn get_lease(&self, run_id: &RunId) -> KernelResult<Option<Lease>>;

    /// Extends the TTL in place; no-op if missing or already expired.
    async fn extend_lease(&self, run_id: &RunId, additional: Duration) -> KernelResult<bool>;

    /// All leases not yet known-expired. Used only by the metrics surface
    /// and the reaper — never by the scheduler's hot path.
    async fn list_active(&self, now: DateTime<Utc>) -> KernelResult<Vec<Lease>>;
}

#[derive(Default)]
pub struct InMemoryLeaseRegistry {
    leases: RwLock<HashMap<RunId, Lease>>,
}

impl InMemoryLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseRegistry for InMemoryLeaseRegistry {
    #[tracing::instrument(skip(self, ttl), fields(run_id = %run_id, node_id = %node_id))]
    async fn acquire_lease(&self, run_id: &RunId, node_id: &NodeId, ttl: Duration) -> KernelResult<bool> {
        let now = Utc::now();
        let mut leases = self.leases.write().expect("lease registry lock poisoned");
        if let Some(existing) = leases.get(run_id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        leases.insert(
            run_id.clone(),
            Lease {
                run_id: run_id.clone(),
                lease_id: LeaseId::generate(),
                holder_node_id: node_id.clone(),
                acquired_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    async fn release_lease(&self, run_id: &RunId) -> KernelResult<bool> {
        let mut leases = self.leases.write().expect("lease registry lock poisoned");
        Ok(leases.remove(run_id).is_some())
    }

    async fn get_lease(&self, run_id: &RunId) -> KernelResult<Option<Lease>> {
        let now = Utc::now();
        let leases = self.leases.read().expect("lease registry lock poisoned");
        Ok(leases
            .get(run_id)
            .filter(|l| !l.is_expired(now))
            .cloned())
    }

    #[tracing::instrument(skip(self, additional), fields(run_id = %run_id))]
    async fn extend_lease(&self, run_id: &RunId, additional: Duration) -> KernelResult<bool> {
        let now = Utc::now();
        let mut leases = self.leases.write().expect("lease registry lock poisoned");
        match leases.get_mut(run_id) {
            Some(lease) if !lease.is_expired(now) => {
                lease.expires_at = lease.expires_at + additional;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self, now: DateTime<Utc>) -> KernelResult<Vec<Lease>> {
        let leases = self.leases.read().expect("lease registry lock poisoned");
        Ok(leases.values().filter(|l| !l.is_expired(now)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (RunId, NodeId) {
        (RunId::from("run-1"), NodeId::from("node-1"))
    }

    #[tokio::test]
    async fn acquire_then_release_then_reacquire_succeeds() {
        let reg = InMemoryLeaseRegistry::new();
        let (run, node) = ids();
        assert!(reg.acquire_lease(&run, &node, Duration::seconds(30)).await.unwrap());
        assert!(reg.release_lease(&run).await.unwrap());
        assert!(reg
            .acquire_lease(&run, &NodeId::from("node-2"), Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_acquire_is_exclusive() {
        let reg = InMemoryLeaseRegistry::new();
        let (run, node) = ids();
        assert!(reg.acquire_lease(&run, &node, Duration::seconds(30)).await.unwrap());
        assert!(!reg
            .acquire_lease(&run, &NodeId::from("node-2"), Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_not_returned_and_can_be_reacquired() {
        let reg = InMemoryLeaseRegistry::new();
        let (run, node) = ids();
        assert!(reg
            .acquire_lease(&run, &node, Duration::milliseconds(-1))
            .await
            .unwrap());
        assert!(reg.get_lease(&run).await.unwrap().is_none());
        assert!(reg
            .acquire_lease(&run, &NodeId::from("node-2"), Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extend_is_noop_on_missing_lease() {
        let reg = InMemoryLeaseRegistry::new();
        let (run, _) = ids();
        assert!(!reg.extend_lease(&run, Duration::seconds(10)).await.unwrap());
    }
}
