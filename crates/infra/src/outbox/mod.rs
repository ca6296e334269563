//! Transactional outbox.
//!
//! Event stores write one [`OutboxMessage`] per destination stream in the same
//! commit that appends the event. A separate [`OutboxPump`] drains the
//! unpublished messages into the broker and marks them published, so a message
//! reaches the broker if and only if its event was committed (at least once).

pub mod pump;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::event_store::StoredEvent;

pub use pump::{Backoff, OutboxPump, PumpConfig};

/// An intent to publish `payload` to `stream`, recorded with the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub stream: String,
    pub payload: String,
}

impl OutboxMessage {
    /// The serialized envelope of `event`, addressed to `stream`.
    pub fn for_event(event: &StoredEvent, stream: impl Into<String>) -> Result<Self, OutboxError> {
        let payload = serde_json::to_string(&event.to_envelope())
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(Self {
            stream: stream.into(),
            payload,
        })
    }
}

/// A committed, not-yet-published outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: i64,
    pub stream: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox storage failure: {0}")]
    Storage(String),

    #[error("outbox serialization failure: {0}")]
    Serialization(String),

    #[error("outbox pump cancelled")]
    Cancelled,
}

/// Read/ack side of the outbox, used by the pump.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest unpublished messages first, at most `limit`.
    async fn pending(&self, limit: usize) -> Result<Vec<PendingMessage>, OutboxError>;

    async fn mark_published(&self, ids: &[i64]) -> Result<(), OutboxError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn pending(&self, limit: usize) -> Result<Vec<PendingMessage>, OutboxError> {
        (**self).pending(limit).await
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<(), OutboxError> {
        (**self).mark_published(ids).await
    }
}

/// Build the outbox rows for a freshly committed event.
pub(crate) fn messages_for(
    event: &StoredEvent,
    streams: &[String],
) -> Result<Vec<OutboxMessage>, OutboxError> {
    streams
        .iter()
        .map(|stream| OutboxMessage::for_event(event, stream.as_str()))
        .collect()
}
