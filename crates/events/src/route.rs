//! Event routing: where each event is delivered after it is committed.

use serde::{Deserialize, Serialize};

/// Prefix shared by every stream key the system writes to.
pub const STREAM_PREFIX: &str = "instapay";

/// A named delivery destination: a partition (usually a bank) plus a topic.
///
/// The broker stream key is `instapay:{partition}:{topic}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    partition: String,
    topic: String,
}

impl Destination {
    pub fn new(partition: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            topic: topic.into(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stream_key(&self) -> String {
        format!("{STREAM_PREFIX}:{}:{}", self.partition, self.topic)
    }
}

impl core::fmt::Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.stream_key())
    }
}

/// Implemented by aggregates whose events fan out to named streams.
///
/// Routing is evaluated against the aggregate state *after* the event has been
/// applied, so state-dependent destinations (e.g. the other party's bank) are
/// available.
pub trait Routable: instapay_core::Aggregate {
    fn route(&self, event: &Self::Event) -> Vec<Destination>;
}
