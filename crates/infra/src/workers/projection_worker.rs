use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::warn;

use instapay_events::{EventEnvelope, Projection};

use crate::broker::StreamMessage;
use crate::consumer::{BatchHandler, ConsumeError};
use crate::projections::ProjectionError;

/// Feeds a projection stream into a [`Projection`].
///
/// Gaps are nacked so the message is reclaimed once the missing predecessor
/// has been applied. Payloads that can never apply are logged and acked. A
/// failing read model aborts the batch, leaving every message pending.
pub struct ProjectionHandler<P> {
    projection: Arc<P>,
}

impl<P> ProjectionHandler<P>
where
    P: Projection<Error = ProjectionError> + Send + Sync + 'static,
    P::Ev: DeserializeOwned,
{
    pub fn new(projection: Arc<P>) -> Self {
        Self { projection }
    }
}

#[async_trait]
impl<P> BatchHandler for ProjectionHandler<P>
where
    P: Projection<Error = ProjectionError> + Send + Sync + 'static,
    P::Ev: DeserializeOwned,
{
    async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
        let mut nacks = Vec::with_capacity(batch.len());
        for msg in batch {
            let envelope = match serde_json::from_str::<EventEnvelope<JsonValue>>(&msg.payload)
                .and_then(|env| env.decode::<P::Ev>())
            {
                Ok(env) => env,
                Err(err) => {
                    warn!(message_id = %msg.id, error = %err, "dropping malformed projection message");
                    nacks.push(false);
                    continue;
                }
            };
            match self.projection.apply(&envelope) {
                Ok(()) => nacks.push(false),
                Err(err @ ProjectionError::ReadModel(_)) => {
                    return Err(ConsumeError::Handler(err.to_string()));
                }
                Err(err) if err.is_transient() => {
                    warn!(message_id = %msg.id, error = %err, "projection deferred");
                    nacks.push(true);
                }
                Err(err) => {
                    warn!(message_id = %msg.id, error = %err, "dropping unprojectable event");
                    nacks.push(false);
                }
            }
        }
        Ok(nacks)
    }
}
