use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use instapay_core::{AccountId, BankId};
use instapay_events::{EventEnvelope, Projection};
use instapay_transactions::{TransactionEvent, TransactionId, TransactionStatus};

use crate::event_store::{EventStore, EventStoreError};
use crate::read_model::{ReadModelError, ReadModelStore};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Denormalized transaction view served to the query side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub sender: AccountId,
    pub sender_bank: BankId,
    pub receiver: AccountId,
    pub receiver_bank: BankId,
    pub amount: u64,
    pub description: String,
    pub status: TransactionStatus,
    pub reason_for_failing: Option<String>,
    /// Sequence number of the last applied event.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionView {
    pub fn is_party(&self, bank: BankId) -> bool {
        self.sender_bank == bank || self.receiver_bank == bank
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize transaction event: {0}")]
    Deserialize(String),

    /// A gap: the envelope is ahead of what has been applied. Retry later.
    #[error("out-of-order event for {aggregate} (last={last}, found={found})")]
    OutOfOrder {
        aggregate: TransactionId,
        last: u64,
        found: u64,
    },

    #[error("inconsistent envelope: {0}")]
    Inconsistent(String),

    #[error("event store failure: {0}")]
    Store(String),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),
}

impl ProjectionError {
    /// Whether redelivering the same envelope later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProjectionError::OutOfOrder { .. } | ProjectionError::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("transaction not found")]
    NotFound,

    #[error("caller is neither the sender's nor the receiver's bank")]
    PermissionDenied,

    #[error(transparent)]
    Unavailable(#[from] ReadModelError),
}

/// Filter for [`TransactionProjection::list_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub created_after: Option<DateTime<Utc>>,
    pub sender: Option<AccountId>,
    pub receiver: Option<AccountId>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl ListFilter {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }

    fn matches(&self, view: &TransactionView) -> bool {
        self.created_after.is_none_or(|t| view.created_at > t)
            && self.sender.is_none_or(|s| view.sender == s)
            && self.receiver.is_none_or(|r| view.receiver == r)
    }
}

/// Transaction read projection.
///
/// A left fold of the event stream keyed by transaction id. Each view keeps
/// the sequence number it has reached, which makes the fold idempotent under
/// at-least-once delivery: already-applied envelopes are skipped and a gap is
/// reported as [`ProjectionError::OutOfOrder`] so the delivery can be retried.
#[derive(Debug)]
pub struct TransactionProjection<S>
where
    S: ReadModelStore<TransactionId, TransactionView>,
{
    store: S,
    // Serializes check-then-write on the store.
    apply_lock: Mutex<()>,
}

impl<S> TransactionProjection<S>
where
    S: ReadModelStore<TransactionId, TransactionView>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            apply_lock: Mutex::new(()),
        }
    }

    /// Unscoped lookup. Prefer [`TransactionProjection::find_for`] on request paths.
    pub fn find(&self, id: TransactionId) -> Result<TransactionView, QueryError> {
        self.store.get(&id)?.ok_or(QueryError::NotFound)
    }

    /// Lookup on behalf of `caller`, who must be one of the two banks.
    pub fn find_for(&self, caller: BankId, id: TransactionId) -> Result<TransactionView, QueryError> {
        let view = self.find(id)?;
        if !view.is_party(caller) {
            return Err(QueryError::PermissionDenied);
        }
        Ok(view)
    }

    /// Transactions visible to `caller`, newest first.
    pub fn list_for(&self, caller: BankId, filter: &ListFilter) -> Result<Vec<TransactionView>, QueryError> {
        let mut views: Vec<_> = self
            .store
            .list()?
            .into_iter()
            .filter(|v| v.is_party(caller) && filter.matches(v))
            .collect();
        views.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        Ok(views
            .into_iter()
            .skip(filter.skip.unwrap_or(0))
            .take(filter.effective_limit())
            .collect())
    }

    /// Apply a published envelope (JSON payload).
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let typed: EventEnvelope<TransactionEvent> = envelope
            .clone()
            .decode()
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;
        self.apply(&typed)
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.store.clear()?;

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        // Deterministic replay order: aggregate, sequence.
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    /// Rebuild from the event store's full log.
    pub async fn rebuild_from_store<E>(&self, store: &E) -> Result<usize, ProjectionError>
    where
        E: EventStore + ?Sized,
    {
        let events = store
            .load_all()
            .await
            .map_err(|e: EventStoreError| ProjectionError::Store(e.to_string()))?;
        let count = events.len();
        self.rebuild_from_scratch(events.iter().map(|e| e.to_envelope()))?;
        Ok(count)
    }
}

impl<S> Projection for TransactionProjection<S>
where
    S: ReadModelStore<TransactionId, TransactionView>,
{
    type Ev = TransactionEvent;
    type Error = ProjectionError;

    fn apply(&self, envelope: &EventEnvelope<TransactionEvent>) -> Result<(), ProjectionError> {
        let event = envelope.payload();
        let id = event.transaction_id();
        if id.0 != envelope.aggregate_id() {
            return Err(ProjectionError::Inconsistent(
                "event transaction_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let _guard = self
            .apply_lock
            .lock()
            .map_err(|_| ReadModelError::Poisoned)?;

        let current = self.store.get(&id)?;
        let last = current.as_ref().map(|v| v.version).unwrap_or(0);
        let seq = envelope.sequence_number();

        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        if seq != last + 1 {
            return Err(ProjectionError::OutOfOrder {
                aggregate: id,
                last,
                found: seq,
            });
        }

        let at = envelope.occurred_at();
        let next = match (current, event) {
            (None, TransactionEvent::Started(e)) => TransactionView {
                id,
                sender: e.sender,
                sender_bank: e.sender_bank,
                receiver: e.receiver,
                receiver_bank: e.receiver_bank,
                amount: e.amount,
                description: e.description.clone(),
                status: TransactionStatus::Started,
                reason_for_failing: None,
                version: seq,
                created_at: at,
                updated_at: at,
            },
            (Some(mut view), TransactionEvent::Confirmed(_)) => {
                view.status = TransactionStatus::Confirmed;
                view
            }
            (Some(mut view), TransactionEvent::Completed(_)) => {
                view.status = TransactionStatus::Completed;
                view
            }
            (Some(mut view), TransactionEvent::Failed(e)) => {
                view.status = TransactionStatus::Failed;
                view.reason_for_failing = Some(e.reason.clone());
                view
            }
            (_, other) => {
                return Err(ProjectionError::Inconsistent(format!(
                    "{} at sequence {seq}",
                    instapay_events::Event::event_type(other)
                )));
            }
        };

        let next = TransactionView {
            version: seq,
            updated_at: at,
            ..next
        };
        self.store.upsert(id, next)?;
        Ok(())
    }
}
