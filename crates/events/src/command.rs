use instapay_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands represent **intent**. They are transient (never persisted) and are
/// either rejected or turned into events, which are the persisted facts.
///
/// `target_aggregate_id()` is what the dispatcher uses to pick the stream to
/// load and append to. Each command operates on exactly one aggregate.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
