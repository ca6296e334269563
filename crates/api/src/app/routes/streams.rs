//! Event channels: `GET /streams/{started|confirmed|completed|failed}` (WebSocket).
//!
//! The connection joins the caller bank's consumer group on the stream of
//! that kind. Each batch is sent as one `batch` frame and must be answered by
//! exactly one `ack` frame carrying a nack flag per event. Nacked events stay
//! pending and are redelivered once they age out. A silent or misbehaving peer
//! (including one that acks while no batch is outstanding) gets an `error`
//! frame and is disconnected, leaving its batch pending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        Extension, Path,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use instapay_events::EventEnvelope;
use instapay_infra::broker::StreamMessage;
use instapay_infra::consumer::{BatchHandler, ConsumeError, StreamConsumer};
use instapay_transactions::EventKind;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::BankContext;
use crate::protocol::{AckFrame, StreamFrame};

type AckResult = Result<Vec<bool>, String>;

const UNSOLICITED_ACK: &str = "ack frame with no batch outstanding";

pub async fn event_channel(
    ws: WebSocketUpgrade,
    Path(kind): Path<String>,
    Extension(services): Extension<Arc<AppServices>>,
    Extension(bank): Extension<BankContext>,
) -> Response {
    let kind: EventKind = match kind.parse() {
        Ok(k) => k,
        Err(e) => return errors::json_error(StatusCode::NOT_FOUND, "unknown_channel", e.to_string()),
    };
    ws.on_upgrade(move |socket| serve(socket, kind, services, bank))
}

async fn serve(socket: WebSocket, kind: EventKind, services: Arc<AppServices>, bank: BankContext) {
    let stream = kind.destination(bank.bank_id()).stream_key();
    let consumer_name = format!("ws-{}", Uuid::now_v7());
    let config = services
        .tuning()
        .consumer(bank.bank_id().to_string(), consumer_name.clone());
    let consumer = StreamConsumer::new(services.broker().clone(), stream.clone(), config);

    let (sink, mut incoming) = socket.split();
    let (ack_tx, ack_rx) = mpsc::channel::<AckResult>(1);
    let awaiting_ack = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    // Reads ack frames; the channel ends when the peer goes away or breaks
    // the one-ack-per-batch rule.
    let reader = {
        let cancel = cancel.clone();
        let awaiting_ack = awaiting_ack.clone();
        tokio::spawn(async move {
            while let Some(msg) = incoming.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let parsed = match serde_json::from_str::<AckFrame>(&text) {
                    Ok(AckFrame::Ack { nacks }) if awaiting_ack.swap(false, Ordering::SeqCst) => Ok(nacks),
                    Ok(AckFrame::Ack { .. }) => Err(UNSOLICITED_ACK.to_string()),
                    Err(e) => Err(format!("expected an ack frame: {e}")),
                };
                let violation = parsed.is_err();
                if ack_tx.send(parsed).await.is_err() || violation {
                    break;
                }
            }
            cancel.cancel();
        })
    };

    info!(stream = %stream, consumer = %consumer_name, "event channel opened");
    let mut peer = PeerChannel {
        sink,
        acks: ack_rx,
        awaiting_ack,
        ack_timeout: services.tuning().ack_timeout,
    };
    let result = consumer.run(&cancel, &mut peer).await;
    // A violation seen while idle cancels the loop before any batch picks it up.
    let result = match (result, peer.acks.try_recv()) {
        (Err(ConsumeError::Cancelled), Ok(Err(message))) => Err(peer.reject(message).await),
        (result, _) => result,
    };
    match result {
        Ok(()) | Err(ConsumeError::Cancelled) => {
            info!(stream = %stream, consumer = %consumer_name, "event channel closed");
        }
        Err(e) => {
            warn!(stream = %stream, consumer = %consumer_name, error = %e, "event channel aborted");
        }
    }
    reader.abort();
}

/// Forwards batches to the peer and turns its ack frame into nack flags.
struct PeerChannel {
    sink: SplitSink<WebSocket, Message>,
    acks: mpsc::Receiver<AckResult>,
    awaiting_ack: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl PeerChannel {
    async fn send(&mut self, frame: &StreamFrame) -> Result<(), ConsumeError> {
        let json = serde_json::to_string(frame).map_err(|e| ConsumeError::Handler(e.to_string()))?;
        self.sink
            .send(Message::Text(json))
            .await
            .map_err(|e| ConsumeError::Handler(format!("peer send failed: {e}")))
    }

    async fn reject(&mut self, message: String) -> ConsumeError {
        let _ = self
            .send(&StreamFrame::Error {
                message: message.clone(),
            })
            .await;
        let _ = self.sink.close().await;
        ConsumeError::Handler(message)
    }
}

#[async_trait]
impl BatchHandler for PeerChannel {
    async fn handle(&mut self, batch: &[StreamMessage]) -> Result<Vec<bool>, ConsumeError> {
        let mut nacks = vec![false; batch.len()];
        let mut events = Vec::with_capacity(batch.len());
        let mut positions = Vec::with_capacity(batch.len());
        for (pos, msg) in batch.iter().enumerate() {
            match serde_json::from_str::<EventEnvelope<JsonValue>>(&msg.payload) {
                Ok(env) => {
                    events.push(env);
                    positions.push(pos);
                }
                Err(e) => warn!(message_id = %msg.id, error = %e, "dropping malformed stream entry"),
            }
        }
        if events.is_empty() {
            return Ok(nacks);
        }

        // Anything queued now was sent before the peer could see this batch.
        if let Ok(queued) = self.acks.try_recv() {
            let message = queued.err().unwrap_or_else(|| UNSOLICITED_ACK.to_string());
            return Err(self.reject(message).await);
        }

        let sent = events.len();
        self.awaiting_ack.store(true, Ordering::SeqCst);
        self.send(&StreamFrame::Batch { events }).await?;

        let reply = tokio::time::timeout(self.ack_timeout, self.acks.recv()).await;
        let peer_nacks = match reply {
            Err(_) => {
                return Err(self
                    .reject(format!("no ack within {} ms", self.ack_timeout.as_millis()))
                    .await);
            }
            Ok(None) => return Err(ConsumeError::Handler("peer disconnected".to_string())),
            Ok(Some(Err(msg))) => return Err(self.reject(msg).await),
            Ok(Some(Ok(peer_nacks))) => peer_nacks,
        };
        if peer_nacks.len() != sent {
            let err = ConsumeError::AckMismatch {
                expected: sent,
                got: peer_nacks.len(),
            };
            let _ = self.reject(err.to_string()).await;
            return Err(err);
        }

        for (pos, nack) in positions.into_iter().zip(peer_nacks) {
            nacks[pos] = nack;
        }
        Ok(nacks)
    }
}
