//! Command channels: `GET /commands/{start|confirm|complete|fail}` (WebSocket).
//!
//! Every text frame is one command issued by the authenticated bank and gets
//! exactly one reply frame.

use std::sync::Arc;

use axum::{
    extract::{
        Extension, Path,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, error, info};

use instapay_core::{AggregateId, BankId};
use instapay_transactions::{
    CompleteTransaction, ConfirmTransaction, FailTransaction, StartTransaction, TransactionCommand,
    TransactionId,
};

use crate::app::errors::{self, WireError};
use crate::app::services::AppServices;
use crate::context::BankContext;
use crate::protocol::{CommandChannel, CommandFrame, ReplyFrame};

pub async fn command_channel(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    Extension(services): Extension<Arc<AppServices>>,
    Extension(bank): Extension<BankContext>,
) -> Response {
    let channel: CommandChannel = match channel.parse() {
        Ok(c) => c,
        Err(msg) => return errors::json_error(StatusCode::NOT_FOUND, "unknown_channel", msg),
    };
    ws.on_upgrade(move |socket| serve(socket, channel, services, bank))
}

async fn serve(mut socket: WebSocket, channel: CommandChannel, services: Arc<AppServices>, bank: BankContext) {
    info!(bank = %bank.bank_id(), channel = %channel, "command channel opened");

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let reply = handle_text(&services, bank.bank_id(), channel, &text).await;
        let json = match serde_json::to_string(&reply) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize reply");
                break;
            }
        };
        if socket.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    info!(bank = %bank.bank_id(), channel = %channel, "command channel closed");
}

async fn handle_text(services: &AppServices, issuer: BankId, channel: CommandChannel, text: &str) -> ReplyFrame {
    let frame: CommandFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return ReplyFrame::error(None, "bad_request", e.to_string()),
    };

    if frame.channel() != channel {
        return ReplyFrame::error(
            frame.id(),
            "wrong_channel",
            format!("{} frame sent on the {channel} channel", frame.channel()),
        );
    }

    let requested = frame.id();
    let result = async {
        let command = to_command(services, issuer, frame).await?;
        let id = command.transaction_id();
        services
            .dispatch(command)
            .await
            .map_err(|e| errors::dispatch_error(&e))?;
        Ok::<_, WireError>(id)
    }
    .await;

    match result {
        Ok(id) => {
            debug!(issuer = %issuer, transaction_id = %id, channel = %channel, "command accepted");
            ReplyFrame::accepted(channel, id)
        }
        Err(e) => ReplyFrame::error(requested, e.code, e.message),
    }
}

/// Build the domain command for `frame`, issued by `issuer`.
async fn to_command(services: &AppServices, issuer: BankId, frame: CommandFrame) -> Result<TransactionCommand, WireError> {
    let occurred_at = Utc::now();
    let command = match frame {
        CommandFrame::Start {
            id,
            sender,
            receiver_key,
            amount,
            description,
        } => {
            let registry = services.registry();
            let sender = registry
                .resolve_account(sender)
                .await
                .map_err(|e| errors::registry_error(&e))?;
            let receiver = registry
                .resolve_key(&receiver_key)
                .await
                .map_err(|e| errors::registry_error(&e))?;

            TransactionCommand::Start(StartTransaction {
                transaction_id: id.unwrap_or_else(|| TransactionId::new(AggregateId::new())),
                issuer_bank: issuer,
                sender: sender.account_id,
                sender_bank: sender.bank_id,
                receiver: receiver.account_id,
                receiver_bank: receiver.bank_id,
                amount,
                description,
                occurred_at,
            })
        }
        CommandFrame::Confirm { id } => TransactionCommand::Confirm(ConfirmTransaction {
            transaction_id: id,
            issuer_bank: issuer,
            occurred_at,
        }),
        CommandFrame::Complete { id } => TransactionCommand::Complete(CompleteTransaction {
            transaction_id: id,
            issuer_bank: issuer,
            occurred_at,
        }),
        CommandFrame::Fail { id, reason } => TransactionCommand::Fail(FailTransaction {
            transaction_id: id,
            issuer_bank: issuer,
            reason,
            occurred_at,
        }),
    };
    Ok(command)
}
