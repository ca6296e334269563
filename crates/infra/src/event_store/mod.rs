//! Append-only event store boundary.
//!
//! Per-aggregate ordered streams with optimistic concurrency, plus the
//! transactional outbox rows written in the same commit.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
