//! Durable stream broker boundary (consumer groups, pending entries, ack).
//!
//! Streams are append-only logs addressed by key (`instapay:{bank}:{kind}`).
//! Each stream can have several named consumer groups; inside a group every
//! message is delivered to one consumer at a time and stays *pending* until it
//! is acknowledged. Pending messages idle for longer than a threshold can be
//! claimed by another consumer of the same group.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use in_memory::InMemoryStreamBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamBroker;

/// Broker-assigned message id (Redis-style `ms-seq`).
pub type MessageId = String;

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: MessageId,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("malformed stream entry: {0}")]
    Deserialization(String),
}

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append `payload` to `stream` (created on demand).
    async fn publish(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError>;

    /// Create `group` on `stream` starting from the beginning. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Take over pending messages of `group` idle for at least `min_idle`.
    ///
    /// Claimed messages are re-delivered to `consumer` and their idle timer
    /// restarts.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Read never-delivered messages, waiting up to `block` for one to arrive.
    ///
    /// A timeout is an empty batch, not an error.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Remove `ids` from the group's pending set.
    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> StreamBroker for Arc<B>
where
    B: StreamBroker + ?Sized,
{
    async fn publish(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
        (**self).publish(stream, payload).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        (**self).ensure_group(stream, group).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        (**self)
            .claim_stale(stream, group, consumer, min_idle, count)
            .await
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        (**self)
            .read_new(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<(), BrokerError> {
        (**self).ack(stream, group, ids).await
    }
}
