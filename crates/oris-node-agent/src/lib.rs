//! C7 Node Lease Loop: the node-side agent that pulls leases from the
//! control plane's streaming lease protocol, invokes the opaque executor,
//! and reports outcomes back via Complete/Fail.

pub mod backoff;
pub mod client;
pub mod executor;
pub mod lease_loop;

pub use client::ControlPlaneClient;
pub use executor::{classify_error, ExecutionError, ExecutionOutput, Executor};
pub use lease_loop::{AgentConfig, Concurrency};
