//! Default event publisher: a bounded in-process broadcast channel.
//!
//! Always available (no store configured), used by tests and by
//! single-process deployments. Satisfies "idempotent initialize,
//! non-blocking publish, logged-not-fatal failure" without needing an
//! external bus; it does not survive a process restart, which is the
//! deliberate tradeoff documented in DESIGN.md.

use async_trait::async_trait;
use oris_kernel::{Event, KernelResult};
use tokio::sync::broadcast;

use crate::publisher::EventPublisher;

pub struct InMemoryEventPublisher {
    sender: broadcast::Sender<Event>,
}

impl InMemoryEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn initialize(&self) -> KernelResult<()> {
        Ok(())
    }

    async fn publish(&self, event: Event) -> KernelResult<()> {
        // No active subscribers is not an error: delivery is at-least-once
        // to whoever is listening, never a precondition for the transition
        // that produced the event.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oris_kernel::EventKind;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let publisher = InMemoryEventPublisher::new(8);
        publisher.initialize().await.unwrap();
        let event = Event::new(EventKind::NodeRegistered, chrono::Utc::now(), serde_json::json!({}));
        publisher.publish(event).await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let publisher = InMemoryEventPublisher::new(8);
        let mut rx = publisher.subscribe();
        let event = Event::new(EventKind::NodeRegistered, chrono::Utc::now(), serde_json::json!({"a":1}));
        publisher.publish(event.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_id, event.event_id);
    }
}
