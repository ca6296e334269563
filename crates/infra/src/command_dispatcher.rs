//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the aggregate's stream (missing stream = fresh aggregate)
//!   ↓
//! 2. Rehydrate (apply history in sequence order)
//!   ↓
//! 3. Handle (pure decision, produces events or a domain error)
//!   ↓
//! 4. Route each event to its destination streams
//!   ↓
//! 5. Append events + outbox rows with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 6. Wake the outbox pump
//! ```
//!
//! A rejected command never reaches step 5, so it leaves nothing behind.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

use instapay_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use instapay_events::{Destination, Routable};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The aggregate rejected the command (never retried).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another writer appended first.
    #[error("optimistic concurrency conflict: {0}")]
    Concurrency(String),

    /// A stored payload no longer decodes into the aggregate's event type.
    #[error("failed to decode stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Every committed event is also routed to the `fan_out` destinations (e.g.
/// the read projection's stream) on top of what the aggregate's `Routable`
/// implementation returns.
pub struct CommandDispatcher<S> {
    store: S,
    fan_out: Vec<Destination>,
    waker: Option<Arc<Notify>>,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            fan_out: Vec::new(),
            waker: None,
        }
    }

    pub fn with_fan_out(mut self, destination: Destination) -> Self {
        self.fan_out.push(destination);
        self
    }

    /// Notify `waker` after every successful commit.
    pub fn with_outbox_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Load, rehydrate, handle and append.
    ///
    /// Returns the committed events with their assigned sequence numbers.
    #[instrument(skip(self, command, make_aggregate), fields(aggregate_id = %aggregate_id), err)]
    pub async fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Routable + Clone,
        A::Event: instapay_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history
        let history = match self.store.load(aggregate_id).await {
            Ok(history) => history,
            Err(EventStoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Route against the post-event state
        let mut next = aggregate.clone();
        let mut uncommitted = Vec::with_capacity(decided.len());
        for ev in &decided {
            next.apply(ev);
            let publish_to = next
                .route(ev)
                .iter()
                .chain(self.fan_out.iter())
                .map(Destination::stream_key)
                .collect();
            uncommitted.push(UncommittedEvent::from_typed(
                aggregate_id,
                aggregate_type,
                Uuid::now_v7(),
                ev,
                publish_to,
            )?);
        }

        // 5) Persist (append-only, optimistic)
        let committed = self.store.append(aggregate_id, expected, uncommitted).await?;

        // 6) Let the pump publish without waiting for its next poll
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }

        debug!(committed = committed.len(), "command committed");
        Ok(committed)
    }

    /// Rebuild the current state of an aggregate from its stream.
    pub async fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load(aggregate_id).await?;
        validate_loaded_stream(aggregate_id, &history)?;
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    // Sequence numbers must be exactly 1..=n for this aggregate.
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::Storage(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number != idx as u64 + 1 {
            return Err(DispatchError::Store(EventStoreError::Storage(format!(
                "non-contiguous sequence_number in loaded stream (index {idx}, found {})",
                e.sequence_number
            ))));
        }
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
