//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD key * payload <json>`
//! - **Groups**: `XGROUP CREATE key group 0 MKSTREAM` (BUSYGROUP ignored)
//! - **Claim**: `XAUTOCLAIM key group consumer min-idle 0 COUNT n`
//! - **Read**: `XREADGROUP GROUP group consumer COUNT n BLOCK ms STREAMS key >`
//! - **Ack**: `XACK key group id...`
//!
//! Blocking reads run on dedicated connections so they do not stall the
//! shared multiplexed connection used by publish/ack. A reader connection is
//! checked out for one `XREADGROUP` and returned to an idle pool afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{BrokerError, MessageId, StreamBroker, StreamMessage};

const PAYLOAD_FIELD: &str = "payload";

/// Reader connections kept open between reads.
const MAX_IDLE_READERS: usize = 16;

/// Idle connections reused across calls, at most `cap` of them.
#[derive(Debug)]
struct IdlePool<T> {
    idle: Mutex<Vec<T>>,
    cap: usize,
}

impl<T> IdlePool<T> {
    fn new(cap: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            cap,
        }
    }

    async fn take(&self) -> Option<T> {
        self.idle.lock().await.pop()
    }

    /// Returns `conn` to the pool; dropped if the pool is full.
    async fn put(&self, conn: T) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.cap {
            idle.push(conn);
        }
    }
}

#[derive(Clone)]
pub struct RedisStreamBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: Arc<IdlePool<MultiplexedConnection>>,
}

impl core::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamBroker").finish_non_exhaustive()
    }
}

impl RedisStreamBroker {
    /// Connect to `redis_url` (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            readers: Arc::new(IdlePool::new(MAX_IDLE_READERS)),
        })
    }

    async fn reader(&self) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.readers.take().await {
            return Ok(conn);
        }
        debug!("opening reader connection");
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
    #[instrument(skip(self, payload), fields(stream = %stream), err)]
    async fn publish(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::ConsumerGroup(format!(
                "XGROUP CREATE {stream} {group} failed: {e}"
            ))),
        }
    }

    #[instrument(skip(self), fields(stream = %stream, group = %group, consumer = %consumer), err)]
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // [next-start-id, [entry...], [deleted-id...]]
        let entries = match reply {
            Value::Bulk(mut parts) if parts.len() >= 2 => parts.swap_remove(1),
            Value::Nil => return Ok(Vec::new()),
            other => {
                return Err(BrokerError::Deserialization(format!(
                    "unexpected XAUTOCLAIM reply: {other:?}"
                )));
            }
        };
        let claimed = parse_entries(entries)?;
        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), "claimed stale pending messages");
        }
        Ok(claimed)
    }

    #[instrument(skip(self), fields(stream = %stream, group = %group, consumer = %consumer), err)]
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.reader().await?;
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| match e.code() {
                Some("NOGROUP") => BrokerError::ConsumerGroup(e.to_string()),
                _ => BrokerError::Command(format!("XREADGROUP failed: {e}")),
            })?;
        // Only a connection that answered goes back; a failed one is dropped.
        self.readers.put(conn).await;

        // Nil on timeout, otherwise [[stream-key, [entry...]]]
        match reply {
            Value::Nil => Ok(Vec::new()),
            Value::Bulk(streams) => {
                let mut out = Vec::new();
                for per_stream in streams {
                    if let Value::Bulk(mut pair) = per_stream {
                        if pair.len() == 2 {
                            out.extend(parse_entries(pair.swap_remove(1))?);
                        }
                    }
                }
                Ok(out)
            }
            other => Err(BrokerError::Deserialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            ))),
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

fn parse_entries(value: Value) -> Result<Vec<StreamMessage>, BrokerError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                // Entries deleted while pending come back as nil.
                if let Some(msg) = parse_stream_entry(entry)? {
                    out.push(msg);
                }
            }
            Ok(out)
        }
        other => Err(BrokerError::Deserialization(format!(
            "expected entry list, got {other:?}"
        ))),
    }
}

/// Entry format: `[id, [field, value, field, value, ...]]`.
fn parse_stream_entry(entry: Value) -> Result<Option<StreamMessage>, BrokerError> {
    let parts = match entry {
        Value::Nil => return Ok(None),
        Value::Bulk(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(BrokerError::Deserialization(format!(
                "invalid entry format: {other:?}"
            )));
        }
    };

    let id = match &parts[0] {
        Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        Value::Status(s) => s.clone(),
        other => {
            return Err(BrokerError::Deserialization(format!(
                "invalid message id: {other:?}"
            )));
        }
    };

    let fields = match &parts[1] {
        Value::Bulk(fields) => fields,
        Value::Nil => return Ok(None),
        other => {
            return Err(BrokerError::Deserialization(format!(
                "invalid fields for {id}: {other:?}"
            )));
        }
    };

    for pair in fields.chunks(2) {
        if let [Value::Data(key), Value::Data(value)] = pair {
            if key.as_slice() == PAYLOAD_FIELD.as_bytes() {
                return Ok(Some(StreamMessage {
                    id,
                    payload: String::from_utf8_lossy(value).to_string(),
                }));
            }
        }
    }

    Err(BrokerError::Deserialization(format!(
        "entry {id} has no payload field"
    )))
}
