//! C6 Event Publisher contract (spec.md §4.8).

use async_trait::async_trait;
use oris_kernel::{Event, KernelResult};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Ensures the durable topic/stream exists with configured retention.
    /// Idempotent; safe to call on every startup.
    async fn initialize(&self) -> KernelResult<()>;

    /// Writes one event. Implementations must never let a failure here
    /// propagate as a hard error to callers that are mid state-transition;
    /// `Err` is logged and counted by the caller, not retried inline.
    async fn publish(&self, event: Event) -> KernelResult<()>;
}
