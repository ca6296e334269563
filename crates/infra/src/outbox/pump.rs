//! Outbox pump: drains committed outbox messages into the stream broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{OutboxError, OutboxStore, PendingMessage};
use crate::broker::StreamBroker;

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial.min(self.max);
        }
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff: Backoff,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            backoff: Backoff::default(),
        }
    }
}

impl PumpConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Publishes unpublished outbox messages to the broker.
///
/// Wakes on the poll interval or when [`OutboxPump::waker`] is notified after
/// a commit. Broker and storage failures are retried with exponential backoff
/// until they succeed or the pump is cancelled; a message is never dropped.
/// Marking happens after publishing, so a crash in between republishes the
/// message (consumers are idempotent).
pub struct OutboxPump<S, B> {
    source: S,
    broker: B,
    config: PumpConfig,
    wake: Arc<Notify>,
}

impl<S, B> OutboxPump<S, B>
where
    S: OutboxStore,
    B: StreamBroker,
{
    pub fn new(source: S, broker: B, config: PumpConfig) -> Self {
        Self {
            source,
            broker,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Share an existing waker (e.g. the one the command dispatcher signals).
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run until cancelled. Returns `OutboxError::Cancelled` on shutdown.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), OutboxError> {
        info!(batch_size = self.config.batch_size, "outbox pump started");
        loop {
            if cancel.is_cancelled() {
                info!("outbox pump stopped");
                return Err(OutboxError::Cancelled);
            }

            let published = self.pump_once(cancel).await?;
            if published > 0 {
                debug!(published, "outbox batch published");
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Publish one batch. Returns how many messages were published.
    pub async fn pump_once(&self, cancel: &CancellationToken) -> Result<usize, OutboxError> {
        let batch = self
            .retry("load pending", cancel, || self.source.pending(self.config.batch_size))
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(batch.len());
        for msg in &batch {
            self.publish(msg, cancel).await?;
            ids.push(msg.id);
        }

        self.retry("mark published", cancel, || self.source.mark_published(&ids))
            .await?;
        Ok(ids.len())
    }

    async fn publish(&self, msg: &PendingMessage, cancel: &CancellationToken) -> Result<(), OutboxError> {
        let mut attempt = 0u32;
        loop {
            match self.broker.publish(&msg.stream, &msg.payload).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(
                        outbox_id = msg.id,
                        stream = %msg.stream,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox publish failed; retrying"
                    );
                    self.sleep(delay, cancel).await?;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn retry<T, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OutboxError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, OutboxError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox storage failure; retrying"
                    );
                    self.sleep(delay, cancel).await?;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), OutboxError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(OutboxError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
