//! Projection implementations (read model builders).
//!
//! Projections consume published envelopes and build query-optimized read
//! models. They are rebuildable from the event log and idempotent under
//! at-least-once delivery.

pub mod transactions;

pub use transactions::{
    DEFAULT_LIST_LIMIT, ListFilter, MAX_LIST_LIMIT, ProjectionError, QueryError,
    TransactionProjection, TransactionView,
};
