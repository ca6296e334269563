use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use instapay_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};
use crate::outbox::{self, OutboxError, OutboxMessage, OutboxStore, PendingMessage};

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    message: OutboxMessage,
    published: bool,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<AggregateId, Vec<StoredEvent>>,
    /// Commit order across all streams.
    log: Vec<StoredEvent>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
}

/// In-memory append-only event store with an embedded outbox.
///
/// Events and their outbox rows are written under the same lock, which is the
/// in-memory equivalent of one database transaction.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, EventStoreError> {
        self.state
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    /// Number of outbox rows not yet marked published.
    pub fn unpublished_count(&self) -> Result<usize, EventStoreError> {
        Ok(self.read()?.outbox.iter().filter(|r| !r.published).count())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(aggregate_id, &events)?;

        let mut state = self.write()?;
        let state = &mut *state;

        let stream = state.streams.entry(aggregate_id).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != events[0].aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, events[0].aggregate_type
                )));
            }
        }

        // Build everything first so a serialization failure leaves no trace.
        let mut committed = Vec::with_capacity(events.len());
        let mut messages = Vec::new();
        for (offset, e) in events.into_iter().enumerate() {
            let (stored, publish_to) = e.into_stored(current + 1 + offset as u64);
            messages.extend(
                outbox::messages_for(&stored, &publish_to)
                    .map_err(|e| EventStoreError::InvalidAppend(e.to_string()))?,
            );
            committed.push(stored);
        }

        stream.extend(committed.iter().cloned());
        state.log.extend(committed.iter().cloned());
        for message in messages {
            state.next_outbox_id += 1;
            state.outbox.push(OutboxRow {
                id: state.next_outbox_id,
                message,
                published: false,
            });
        }

        Ok(committed)
    }

    async fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        match state.streams.get(&aggregate_id) {
            Some(stream) if !stream.is_empty() => Ok(stream.clone()),
            _ => Err(EventStoreError::NotFound(aggregate_id)),
        }
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        Ok(self.read()?.log.clone())
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn pending(&self, limit: usize) -> Result<Vec<PendingMessage>, OutboxError> {
        let state = self
            .state
            .read()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;
        Ok(state
            .outbox
            .iter()
            .filter(|r| !r.published)
            .take(limit)
            .map(|r| PendingMessage {
                id: r.id,
                stream: r.message.stream.clone(),
                payload: r.message.payload.clone(),
            })
            .collect())
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<(), OutboxError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))?;
        for row in state.outbox.iter_mut() {
            if ids.contains(&row.id) {
                row.published = true;
            }
        }
        Ok(())
    }
}
