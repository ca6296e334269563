use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{BrokerError, MessageId, StreamBroker, StreamMessage};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, String>,
    groups: HashMap<String, Group>,
}

impl Stream {
    /// Drop the entries every group has both delivered and acked.
    ///
    /// A stream without groups keeps everything, since a group created later
    /// reads from the beginning.
    fn trim(&mut self) {
        let floor = self
            .groups
            .values()
            .map(|g| match g.pending.keys().next() {
                Some(&oldest) => g.last_delivered.min(oldest - 1),
                None => g.last_delivered,
            })
            .min();
        if let Some(floor) = floor {
            self.entries = self.entries.split_off(&(floor + 1));
        }
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Stream>,
    next_seq: u64,
}

/// In-memory stream broker with consumer groups and a pending-entries list.
///
/// Mirrors the Redis Streams semantics the system relies on (XADD, XGROUP
/// CREATE .. 0 MKSTREAM, XREADGROUP >, XAUTOCLAIM, XACK). Intended for tests,
/// dev and single-process deployments.
#[derive(Debug)]
pub struct InMemoryStreamBroker {
    state: Mutex<State>,
    appended: watch::Sender<u64>,
}

impl Default for InMemoryStreamBroker {
    fn default() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            appended,
        }
    }
}

impl InMemoryStreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Command("lock poisoned".to_string()))
    }

    /// Number of entries still retained on `stream`.
    pub fn stream_len(&self, stream: &str) -> Result<usize, BrokerError> {
        let state = self.lock()?;
        Ok(state.streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }

    /// Number of delivered, unacknowledged messages of `group` on `stream`.
    pub fn pending_count(&self, stream: &str, group: &str) -> Result<usize, BrokerError> {
        let state = self.lock()?;
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }

    /// Times the message `id` has been delivered to `group` (0 once acked).
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Result<u32, BrokerError> {
        let seq = parse_id(id)?;
        let state = self.lock()?;
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&seq))
            .map(|p| p.deliveries)
            .unwrap_or(0))
    }

    /// Consumer currently holding the pending message `id`, if any.
    pub fn pending_owner(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<Option<String>, BrokerError> {
        let seq = parse_id(id)?;
        let state = self.lock()?;
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&seq))
            .map(|p| p.consumer.clone()))
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut state = self.lock()?;
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut out = Vec::new();
        for (&seq, payload) in s.entries.range(g.last_delivered + 1..).take(count) {
            g.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            g.last_delivered = seq;
            out.push(StreamMessage {
                id: format_id(seq),
                payload: payload.clone(),
            });
        }
        Ok(out)
    }
}

fn format_id(seq: u64) -> MessageId {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64, BrokerError> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<u64>().ok())
        .ok_or_else(|| BrokerError::Command(format!("invalid stream id: {id}")))
}

fn no_group(stream: &str, group: &str) -> BrokerError {
    BrokerError::ConsumerGroup(format!("NOGROUP no such group '{group}' for stream '{stream}'"))
}

#[async_trait]
impl StreamBroker for InMemoryStreamBroker {
    async fn publish(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
        let id = {
            let mut state = self.lock()?;
            state.next_seq += 1;
            let seq = state.next_seq;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .insert(seq, payload.to_string());
            format_id(seq)
        };
        self.appended.send_modify(|n| *n += 1);
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut state = self.lock()?;
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut out = Vec::new();
        for (&seq, pending) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            // Pending entries are never trimmed, so this always has a payload.
            let Some(payload) = s.entries.get(&seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            out.push(StreamMessage {
                id: format_id(seq),
                payload: payload.clone(),
            });
        }
        Ok(out)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let deadline = Instant::now() + block;
        loop {
            // Subscribe before looking so an append in between still wakes us.
            let mut appended = self.appended.subscribe();

            let batch = self.take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            match tokio::time::timeout_at(deadline, appended.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        for id in ids {
            g.pending.remove(&parse_id(id)?);
        }
        s.trim();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "instapay:bank-b:started";
    const GROUP: &str = "bank-b";

    #[tokio::test]
    async fn group_starts_from_beginning_and_splits_between_consumers() {
        let broker = InMemoryStreamBroker::new();
        broker.publish(STREAM, "one").await.unwrap();
        broker.publish(STREAM, "two").await.unwrap();
        broker.ensure_group(STREAM, GROUP).await.unwrap();
        broker.ensure_group(STREAM, GROUP).await.unwrap();

        let a = broker
            .read_new(STREAM, GROUP, "a", 1, Duration::from_millis(10))
            .await
            .unwrap();
        let b = broker
            .read_new(STREAM, GROUP, "b", 10, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(a[0].payload, "one");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].payload, "two");
        assert_eq!(broker.pending_count(STREAM, GROUP).unwrap(), 2);
    }

    #[tokio::test]
    async fn read_times_out_empty() {
        let broker = InMemoryStreamBroker::new();
        broker.ensure_group(STREAM, GROUP).await.unwrap();
        let batch = broker
            .read_new(STREAM, GROUP, "a", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_publish() {
        let broker = std::sync::Arc::new(InMemoryStreamBroker::new());
        broker.ensure_group(STREAM, GROUP).await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read_new(STREAM, GROUP, "a", 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(STREAM, "late").await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "late");
    }

    #[tokio::test]
    async fn unacked_message_is_claimable_after_idle_and_acked_is_not() {
        let broker = InMemoryStreamBroker::new();
        broker.ensure_group(STREAM, GROUP).await.unwrap();
        let kept = broker.publish(STREAM, "kept").await.unwrap();
        broker.publish(STREAM, "acked").await.unwrap();

        let batch = broker
            .read_new(STREAM, GROUP, "a", 10, Duration::from_millis(10))
            .await
            .unwrap();
        broker.ack(STREAM, GROUP, &[batch[1].id.clone()]).await.unwrap();

        let early = broker
            .claim_stale(STREAM, GROUP, "b", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(70)).await;
        let claimed = broker
            .claim_stale(STREAM, GROUP, "b", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, kept);
        assert_eq!(broker.delivery_count(STREAM, GROUP, &kept).unwrap(), 2);
        assert_eq!(
            broker.pending_owner(STREAM, GROUP, &kept).unwrap().as_deref(),
            Some("b")
        );

        broker.ack(STREAM, GROUP, &[kept]).await.unwrap();
        assert_eq!(broker.pending_count(STREAM, GROUP).unwrap(), 0);
    }

    #[tokio::test]
    async fn entries_are_trimmed_once_every_group_has_acked_them() {
        let broker = InMemoryStreamBroker::new();
        broker.ensure_group(STREAM, "bank-a").await.unwrap();
        broker.ensure_group(STREAM, GROUP).await.unwrap();
        for payload in ["one", "two", "three"] {
            broker.publish(STREAM, payload).await.unwrap();
        }

        let a = broker
            .read_new(STREAM, "bank-a", "a", 10, Duration::from_millis(10))
            .await
            .unwrap();
        let ids: Vec<_> = a.iter().map(|m| m.id.clone()).collect();
        broker.ack(STREAM, "bank-a", &ids).await.unwrap();
        // The other group has not read anything yet.
        assert_eq!(broker.stream_len(STREAM).unwrap(), 3);

        let b = broker
            .read_new(STREAM, GROUP, "b", 2, Duration::from_millis(10))
            .await
            .unwrap();
        // "one" is still pending, so nothing behind it goes either.
        broker.ack(STREAM, GROUP, &[b[1].id.clone()]).await.unwrap();
        assert_eq!(broker.stream_len(STREAM).unwrap(), 3);

        broker.ack(STREAM, GROUP, &[b[0].id.clone()]).await.unwrap();
        // "three" was never delivered to this group.
        assert_eq!(broker.stream_len(STREAM).unwrap(), 1);

        let rest = broker
            .read_new(STREAM, GROUP, "b", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "three");
        broker.ack(STREAM, GROUP, &[rest[0].id.clone()]).await.unwrap();
        assert_eq!(broker.stream_len(STREAM).unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_group_is_an_error() {
        let broker = InMemoryStreamBroker::new();
        let err = broker
            .read_new(STREAM, "nobody", "a", 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConsumerGroup(_)));
    }
}
