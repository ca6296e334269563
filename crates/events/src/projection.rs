use crate::{Event, EventEnvelope};

/// A projection builds a read model from an append-only event stream.
///
/// Projections must be **idempotent**: events are delivered at least once, so
/// applying an envelope that was already seen has to be a no-op. The usual way
/// is to remember the last applied `sequence_number` per aggregate.
///
/// Read models are disposable and can be rebuilt from the event log at any time.
pub trait Projection {
    type Ev: Event;
    type Error: core::fmt::Debug;

    /// Apply a single envelope, updating the read model.
    fn apply(&self, envelope: &EventEnvelope<Self::Ev>) -> Result<(), Self::Error>;
}
