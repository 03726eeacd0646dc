//! Auxiliary owner-scoped TTL lock (spec.md §3, §5) used to coordinate
//! cross-instance operations such as the periodic node reaper: only one
//! control-plane instance should run the reap sweep at a time.
//!
//! Keyed by an arbitrary lock name (e.g. `"node-reaper"`) so a single store
//! can back multiple independently-coordinated jobs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oris_kernel::{KernelResult, LockRecord};

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquires `key` for `owner` if unheld or expired. Atomic.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> KernelResult<bool>;

    /// Releases `key` iff currently held by `owner`; a non-owner release is a no-op.
    async fn release(&self, key: &str, owner: &str) -> KernelResult<bool>;

    /// Extends the TTL iff currently held by `owner` and not expired.
    async fn extend(&self, key: &str, owner: &str, additional: Duration) -> KernelResult<bool>;
}

#[derive(Default)]
pub struct InMemoryDistributedLock {
    locks: RwLock<HashMap<String, LockRecord>>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> KernelResult<bool> {
        let now = Utc::now();
        let mut locks = self.locks.write().expect("dist lock poisoned");
        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(now) && existing.owner != owner {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockRecord {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> KernelResult<bool> {
        let now = Utc::now();
        let mut locks = self.locks.write().expect("dist lock poisoned");
        match locks.get(key) {
            Some(record) if record.is_held_by(owner, now) => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, owner: &str, additional: Duration) -> KernelResult<bool> {
        let now = Utc::now();
        let mut locks = self.locks.write().expect("dist lock poisoned");
        match locks.get_mut(key) {
            Some(record) if record.is_held_by(owner, now) => {
                record.expires_at = record.expires_at + additional;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_owner_cannot_acquire_while_held() {
        let lock = InMemoryDistributedLock::new();
        assert!(lock.try_acquire("reaper", "a", Duration::seconds(30)).await.unwrap());
        assert!(!lock.try_acquire("reaper", "b", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn only_the_owner_can_release() {
        let lock = InMemoryDistributedLock::new();
        lock.try_acquire("reaper", "a", Duration::seconds(30)).await.unwrap();
        assert!(!lock.release("reaper", "b").await.unwrap());
        assert!(lock.release("reaper", "a").await.unwrap());
        assert!(lock.try_acquire("reaper", "b", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired_by_a_new_owner() {
        let lock = InMemoryDistributedLock::new();
        lock.try_acquire("reaper", "a", Duration::milliseconds(-1)).await.unwrap();
        assert!(lock.try_acquire("reaper", "b", Duration::seconds(30)).await.unwrap());
    }

    #[tokio::test]
    async fn only_the_owner_can_extend() {
        let lock = InMemoryDistributedLock::new();
        lock.try_acquire("reaper", "a", Duration::seconds(5)).await.unwrap();
        assert!(!lock.extend("reaper", "b", Duration::seconds(5)).await.unwrap());
        assert!(lock.extend("reaper", "a", Duration::seconds(5)).await.unwrap());
    }
}
