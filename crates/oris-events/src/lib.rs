//! C6 Event Publisher: best-effort durable publication of run/node/agent
//! state-change events (spec.md §4.8).

pub mod memory;
pub mod publisher;

#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

#[cfg(feature = "kernel-postgres")]
pub mod postgres;

pub use memory::InMemoryEventPublisher;
pub use publisher::EventPublisher;

#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteEventPublisher;

#[cfg(feature = "kernel-postgres")]
pub use postgres::PostgresEventPublisher;
