//! C1 Lease Registry, C2 Run Store, C3 Node Registry and C4 Scheduler:
//! the control plane's scheduling core (spec.md §4.1-§4.4).

pub mod dist_lock;
pub mod lease_registry;
pub mod node_registry;
pub mod run_store;
pub mod scheduler;

#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

#[cfg(test)]
mod contract_tests;

pub use dist_lock::{DistributedLock, InMemoryDistributedLock};
pub use lease_registry::{InMemoryLeaseRegistry, LeaseRegistry};
pub use node_registry::{InMemoryNodeRegistry, NodeRegistry};
pub use run_store::{InMemoryRunStore, RunStore};
pub use scheduler::{NoCapacityReason, Scheduler, SchedulerConfig};

#[cfg(feature = "sqlite-persistence")]
pub use sqlite::{SqliteLeaseRegistry, SqliteNodeRegistry, SqliteRunStore};
