//! Stream consumer loop: claim stale, read new, hand off, ack.
//!
//! One loop per (stream, group, consumer). Each iteration:
//!
//! 1. claim pending messages of the group idle longer than `max_pending_age`
//! 2. if nothing was claimed, block-read new messages for up to `block`
//! 3. pass the batch to the [`BatchHandler`]
//! 4. receive one nack flag per message
//! 5. ack every message whose flag is `false`; nacked ones stay pending and
//!    are reclaimed by step 1 once they age out
//!
//! Broker failures and ack-count mismatches end the loop with an error; the
//! caller decides whether to reconnect.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{BrokerError, StreamBroker, StreamMessage};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub max_pending_age: Duration,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 32,
            block: Duration::from_secs(2),
            max_pending_age: Duration::from_secs(30),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_max_pending_age(mut self, max_pending_age: Duration) -> Self {
        self.max_pending_age = max_pending_age;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("ack covers {got} messages, batch had {expected}")]
    AckMismatch { expected: usize, got: usize },

    #[error("batch handler failed: {0}")]
    Handler(String),

    #[error("consumer cancelled")]
    Cancelled,
}

/// Application side of the consume loop.
#[async_trait]
pub trait BatchHandler: Send {
    /// Process `batch` and return one nack flag per message, in order.
    ///
    /// `true` leaves the message pending for a later reclaim.
    async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError>;
}

pub struct StreamConsumer<B> {
    broker: B,
    stream: String,
    config: ConsumerConfig,
}

impl<B> StreamConsumer<B>
where
    B: StreamBroker,
{
    pub fn new(broker: B, stream: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            stream: stream.into(),
            config,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run until cancelled or until the broker/handler fails.
    pub async fn run<H>(&self, cancel: &CancellationToken, handler: &mut H) -> Result<(), ConsumeError>
    where
        H: BatchHandler + ?Sized,
    {
        let cfg = &self.config;
        self.broker.ensure_group(&self.stream, &cfg.group).await?;
        info!(
            stream = %self.stream,
            group = %cfg.group,
            consumer = %cfg.consumer,
            "stream consumer started"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(ConsumeError::Cancelled);
            }

            let mut batch = self
                .broker
                .claim_stale(
                    &self.stream,
                    &cfg.group,
                    &cfg.consumer,
                    cfg.max_pending_age,
                    cfg.batch_size,
                )
                .await?;
            if !batch.is_empty() {
                debug!(stream = %self.stream, claimed = batch.len(), "reclaimed stale messages");
            } else {
                batch = tokio::select! {
                    _ = cancel.cancelled() => return Err(ConsumeError::Cancelled),
                    read = self.broker.read_new(
                        &self.stream,
                        &cfg.group,
                        &cfg.consumer,
                        cfg.batch_size,
                        cfg.block,
                    ) => read?,
                };
            }
            if batch.is_empty() {
                continue;
            }

            let nacks = tokio::select! {
                _ = cancel.cancelled() => return Err(ConsumeError::Cancelled),
                handled = handler.handle(&batch) => handled?,
            };
            if nacks.len() != batch.len() {
                return Err(ConsumeError::AckMismatch {
                    expected: batch.len(),
                    got: nacks.len(),
                });
            }

            let acked: Vec<_> = batch
                .iter()
                .zip(&nacks)
                .filter(|(_, nack)| !**nack)
                .map(|(msg, _)| msg.id.clone())
                .collect();
            self.broker.ack(&self.stream, &cfg.group, &acked).await?;
            debug!(
                stream = %self.stream,
                consumer = %cfg.consumer,
                delivered = batch.len(),
                acked = acked.len(),
                "batch settled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryStreamBroker;
    use std::sync::Arc;

    const STREAM: &str = "instapay:bank-b:started";

    struct Recorder {
        seen: Vec<String>,
        nack_first_delivery_of: Option<String>,
        stop_after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
            let mut nacks = Vec::with_capacity(batch.len());
            for msg in batch {
                let nack = self.nack_first_delivery_of.as_deref() == Some(msg.payload.as_str());
                if nack {
                    self.nack_first_delivery_of = None;
                }
                self.seen.push(msg.payload.clone());
                nacks.push(nack);
            }
            if self.seen.len() >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(nacks)
        }
    }

    struct ShortAck;

    #[async_trait]
    impl BatchHandler for ShortAck {
        async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
            Ok(vec![false; batch.len().saturating_sub(1)])
        }
    }

    fn config(consumer: &str) -> ConsumerConfig {
        ConsumerConfig::new("bank-b", consumer)
            .with_block(Duration::from_millis(20))
            .with_max_pending_age(Duration::from_millis(40))
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_after_pending_age() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        broker.publish(STREAM, "e1").await.unwrap();
        broker.publish(STREAM, "e2").await.unwrap();

        let cancel = CancellationToken::new();
        let mut handler = Recorder {
            seen: vec![],
            nack_first_delivery_of: Some("e1".to_string()),
            stop_after: 3,
            cancel: cancel.clone(),
        };
        let consumer = StreamConsumer::new(broker.clone(), STREAM, config("c1"));

        let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(&cancel, &mut handler))
            .await
            .expect("consumer should finish");
        assert!(matches!(result, Err(ConsumeError::Cancelled)));
        assert_eq!(handler.seen, vec!["e1", "e2", "e1"]);
        assert_eq!(broker.pending_count(STREAM, "bank-b").unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_count_mismatch_aborts_the_loop() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        broker.publish(STREAM, "e1").await.unwrap();

        let consumer = StreamConsumer::new(broker.clone(), STREAM, config("c1"));
        let err = consumer
            .run(&CancellationToken::new(), &mut ShortAck)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::AckMismatch { expected: 1, got: 0 }));
        assert_eq!(broker.pending_count(STREAM, "bank-b").unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_read() {
        let broker = Arc::new(InMemoryStreamBroker::new());
        let consumer = StreamConsumer::new(
            broker,
            STREAM,
            config("c1").with_block(Duration::from_secs(60)),
        );
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let mut handler = ShortAck;
        let result = tokio::time::timeout(Duration::from_secs(5), consumer.run(&cancel, &mut handler))
            .await
            .expect("cancel should unblock the read");
        assert!(matches!(result, Err(ConsumeError::Cancelled)));
        stopper.await.unwrap();
    }
}
