//! Bank-side agent: the consuming half of the settlement handshake.
//!
//! A [`BankAgent`] subscribes to one event channel of its bank, asks a
//! [`SettlementPolicy`] what to do with each event and sends the follow-up
//! command on the matching command channel:
//!
//! | received (channel) | bank     | follow-up                      |
//! |--------------------|----------|--------------------------------|
//! | `started`          | receiver | `confirm`, or `fail` if refused |
//! | `confirmed`        | sender   | `complete`, or `fail` if refused |
//! | `completed`        | receiver | none (settled)                 |
//! | `failed`           | either   | none                           |
//!
//! Every handled event is acked, whatever became of its follow-up: a command
//! that is rejected or cannot be delivered is logged on the command side and
//! never turned into a nack of the event stream. Cancellation stops a session
//! mid-batch without acking, so the unsettled events stay pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use instapay_events::EventEnvelope;
use instapay_infra::workers::{WorkerHandle, spawn_supervised};
use instapay_transactions::{EventKind, TransactionEvent};

use crate::protocol::{AckFrame, CommandChannel, CommandFrame, ReplyFrame, StreamFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tries per follow-up command; each retry reopens the command channel.
const COMMAND_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server closed the channel")]
    Closed,

    #[error("agent cancelled")]
    Cancelled,
}

/// Outcome of reviewing an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Refuse { reason: String },
}

/// The bank's business rules for incoming settlement steps.
pub trait SettlementPolicy: Send + Sync {
    /// Review a transaction this bank must confirm (as receiver) or
    /// complete (as sender).
    fn review(&self, event: &TransactionEvent) -> Decision;
}

/// Accepts every transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SettlementPolicy for AcceptAll {
    fn review(&self, _event: &TransactionEvent) -> Decision {
        Decision::Accept
    }
}

/// The command a bank sends in reaction to `event`, if any.
pub fn react(policy: &dyn SettlementPolicy, event: &TransactionEvent) -> Option<CommandFrame> {
    let id = event.transaction_id();
    let follow_up = match event {
        TransactionEvent::Started(_) => CommandFrame::Confirm { id },
        TransactionEvent::Confirmed(_) => CommandFrame::Complete { id },
        TransactionEvent::Completed(_) | TransactionEvent::Failed(_) => return None,
    };
    match policy.review(event) {
        Decision::Accept => Some(follow_up),
        Decision::Refuse { reason } => Some(CommandFrame::Fail { id, reason }),
    }
}

/// Drives one event channel of one bank.
pub struct BankAgent {
    server_url: String,
    token: String,
    kind: EventKind,
    policy: Arc<dyn SettlementPolicy>,
}

impl BankAgent {
    /// `server_url` is the `ws://host:port` base of the settlement server.
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        kind: EventKind,
        policy: Arc<dyn SettlementPolicy>,
    ) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            kind,
            policy,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Run sessions until `cancel` fires, reconnecting `reconnect` after each
    /// failure.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken, reconnect: Duration) -> WorkerHandle {
        let name = match self.kind {
            EventKind::Started => "agent-started",
            EventKind::Confirmed => "agent-confirmed",
            EventKind::Completed => "agent-completed",
            EventKind::Failed => "agent-failed",
        };
        spawn_supervised(name, cancel, reconnect, move |token| {
            let agent = self.clone();
            async move { agent.run_session(&token).await }
        })
    }

    /// One connection to the event channel, until it fails or is cancelled.
    pub async fn run_session(&self, cancel: &CancellationToken) -> Result<(), PeerError> {
        let mut events = self.connect(&format!("/streams/{}", self.kind), cancel).await?;
        let mut commands: HashMap<CommandChannel, Socket> = HashMap::new();
        info!(kind = %self.kind, "agent connected");

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = events.close(None).await;
                    return Err(PeerError::Cancelled);
                }
                msg = events.next() => msg,
            };
            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(PeerError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };

            let batch = match serde_json::from_str::<StreamFrame>(&text) {
                Ok(StreamFrame::Batch { events: batch }) => batch,
                Ok(StreamFrame::Error { message }) => return Err(PeerError::Protocol(message)),
                Err(e) => return Err(PeerError::Protocol(format!("unexpected frame: {e}"))),
            };

            for envelope in &batch {
                self.settle(envelope, &mut commands, cancel).await?;
            }
            debug!(kind = %self.kind, delivered = batch.len(), "acking batch");
            let nacks = vec![false; batch.len()];
            send_json(&mut events, &AckFrame::Ack { nacks }).await?;
        }
    }

    /// Handle one event and issue its follow-up command, if any.
    ///
    /// Only cancellation is reported as an error.
    async fn settle(
        &self,
        envelope: &EventEnvelope<JsonValue>,
        commands: &mut HashMap<CommandChannel, Socket>,
        cancel: &CancellationToken,
    ) -> Result<(), PeerError> {
        let event: TransactionEvent = match serde_json::from_value(envelope.payload().clone()) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(event_id = %envelope.event_id(), error = %e, "ignoring undecodable event");
                return Ok(());
            }
        };

        let Some(frame) = react(self.policy.as_ref(), &event) else {
            info!(transaction_id = %event.transaction_id(), kind = %self.kind, "transaction settled");
            return Ok(());
        };

        let channel = frame.channel();
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.send_command(commands, &frame, cancel).await {
                Ok(reply) => break Ok(reply),
                Err(PeerError::Cancelled) => return Err(PeerError::Cancelled),
                Err(e) => {
                    commands.remove(&channel);
                    if attempt >= COMMAND_ATTEMPTS {
                        break Err(e);
                    }
                    warn!(
                        transaction_id = %event.transaction_id(),
                        %channel,
                        attempt,
                        error = %e,
                        "command channel failed, reopening"
                    );
                }
            }
        };

        match outcome {
            Ok(ReplyFrame::Error { code, message, .. }) => {
                // Usually a redelivery of an event that was already handled.
                warn!(transaction_id = %event.transaction_id(), %channel, %code, %message, "command rejected");
            }
            Ok(reply) => {
                debug!(transaction_id = %event.transaction_id(), ?reply, "command accepted");
            }
            Err(e) => {
                error!(
                    transaction_id = %event.transaction_id(),
                    %channel,
                    error = %e,
                    "follow-up command not delivered"
                );
            }
        }
        Ok(())
    }

    async fn send_command(
        &self,
        commands: &mut HashMap<CommandChannel, Socket>,
        frame: &CommandFrame,
        cancel: &CancellationToken,
    ) -> Result<ReplyFrame, PeerError> {
        let channel = frame.channel();
        if !commands.contains_key(&channel) {
            let socket = self.connect(&format!("/commands/{channel}"), cancel).await?;
            commands.insert(channel, socket);
        }
        let socket = commands
            .get_mut(&channel)
            .ok_or_else(|| PeerError::Request(format!("no connection for {channel}")))?;

        send_json(socket, frame).await?;
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                msg = socket.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| PeerError::Protocol(format!("unexpected reply: {e}")));
                }
                Some(Ok(Message::Close(_))) | None => return Err(PeerError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn connect(&self, path: &str, cancel: &CancellationToken) -> Result<Socket, PeerError> {
        let mut request = format!("{}{path}", self.server_url)
            .into_client_request()
            .map_err(|e| PeerError::Request(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| PeerError::Request(e.to_string()))?;
        request.headers_mut().insert("authorization", bearer);

        let (socket, _) = tokio::select! {
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            connected = tokio_tungstenite::connect_async(request) => connected?,
        };
        Ok(socket)
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut Socket, frame: &T) -> Result<(), PeerError> {
    let json = serde_json::to_string(frame).map_err(|e| PeerError::Protocol(e.to_string()))?;
    socket.send(Message::Text(json)).await?;
    Ok(())
}
