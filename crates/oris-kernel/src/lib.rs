//! Core data model, run state machine and error taxonomy shared by every
//! Oris control-plane crate.
//!
//! This crate has no I/O and no async runtime dependency: it is the part of
//! the system every store, scheduler and protocol implementation agrees on.

pub mod constraints;
pub mod dist_lock;
pub mod error;
pub mod event;
pub mod identity;
pub mod lease;
pub mod node;
pub mod run;

pub use constraints::ScheduleConstraints;
pub use dist_lock::LockRecord;
pub use error::{ErrorKind, KernelError, KernelResult};
pub use event::{Event, EventKind};
pub use identity::{EventId, LeaseId, NodeId, RunId};
pub use lease::Lease;
pub use node::{Node, NodeCapacity, NodeLiveStatus, NodeMetadata, NodeState};
pub use run::{Budgets, Costs, ErrorInfo, Run, RunFilter, RunPatch, RunSpec, RunStatus, Timings};
