//! JSON frames exchanged over the command and event channels.
//!
//! Every frame is a WebSocket text message tagged by `type`.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use instapay_core::AccountId;
use instapay_events::EventEnvelope;
use instapay_transactions::TransactionId;

/// One command channel per command kind: `/commands/{channel}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandChannel {
    Start,
    Confirm,
    Complete,
    Fail,
}

impl CommandChannel {
    pub const ALL: [CommandChannel; 4] = [
        CommandChannel::Start,
        CommandChannel::Confirm,
        CommandChannel::Complete,
        CommandChannel::Fail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandChannel::Start => "start",
            CommandChannel::Confirm => "confirm",
            CommandChannel::Complete => "complete",
            CommandChannel::Fail => "fail",
        }
    }
}

impl fmt::Display for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandChannel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown command channel '{s}'"))
    }
}

/// Client → server on a command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandFrame {
    Start {
        /// Client-chosen id; the server picks one when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<TransactionId>,
        sender: AccountId,
        receiver_key: String,
        amount: u64,
        #[serde(default)]
        description: String,
    },
    Confirm {
        id: TransactionId,
    },
    Complete {
        id: TransactionId,
    },
    Fail {
        id: TransactionId,
        reason: String,
    },
}

impl CommandFrame {
    pub fn channel(&self) -> CommandChannel {
        match self {
            CommandFrame::Start { .. } => CommandChannel::Start,
            CommandFrame::Confirm { .. } => CommandChannel::Confirm,
            CommandFrame::Complete { .. } => CommandChannel::Complete,
            CommandFrame::Fail { .. } => CommandChannel::Fail,
        }
    }

    pub fn id(&self) -> Option<TransactionId> {
        match self {
            CommandFrame::Start { id, .. } => *id,
            CommandFrame::Confirm { id } | CommandFrame::Complete { id } | CommandFrame::Fail { id, .. } => {
                Some(*id)
            }
        }
    }
}

/// Server → client on a command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyFrame {
    Started { id: TransactionId },
    Confirmed { id: TransactionId },
    Completed { id: TransactionId },
    Failed { id: TransactionId },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<TransactionId>,
        code: String,
        message: String,
    },
}

impl ReplyFrame {
    pub fn accepted(channel: CommandChannel, id: TransactionId) -> Self {
        match channel {
            CommandChannel::Start => ReplyFrame::Started { id },
            CommandChannel::Confirm => ReplyFrame::Confirmed { id },
            CommandChannel::Complete => ReplyFrame::Completed { id },
            CommandChannel::Fail => ReplyFrame::Failed { id },
        }
    }

    pub fn error(id: Option<TransactionId>, code: impl Into<String>, message: impl Into<String>) -> Self {
        ReplyFrame::Error {
            id,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Server → client on an event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Batch { events: Vec<EventEnvelope<JsonValue>> },
    Error { message: String },
}

/// Client → server on an event channel; exactly one per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AckFrame {
    Ack { nacks: Vec<bool> },
}
