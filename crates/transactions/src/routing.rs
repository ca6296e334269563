//! Which bank streams each transaction event is delivered to.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use instapay_core::{BankId, DomainError};
use instapay_events::{Destination, Routable};

use crate::transaction::{Transaction, TransactionEvent};

pub const PROJECTION_PARTITION: &str = "projection";
pub const PROJECTION_TOPIC: &str = "transactions";

/// The four event channels a bank can subscribe to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Confirmed,
    Completed,
    Failed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Started,
        EventKind::Confirmed,
        EventKind::Completed,
        EventKind::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Confirmed => "confirmed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }

    pub fn of(event: &TransactionEvent) -> Self {
        match event {
            TransactionEvent::Started(_) => EventKind::Started,
            TransactionEvent::Confirmed(_) => EventKind::Confirmed,
            TransactionEvent::Completed(_) => EventKind::Completed,
            TransactionEvent::Failed(_) => EventKind::Failed,
        }
    }

    /// The stream of `kind` events addressed to `bank`.
    pub fn destination(&self, bank: BankId) -> Destination {
        Destination::new(bank.to_string(), self.as_str())
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown event kind: {s}")))
    }
}

/// The stream feeding the read projection (every event, every bank).
pub fn projection_destination() -> Destination {
    Destination::new(PROJECTION_PARTITION, PROJECTION_TOPIC)
}

impl Routable for Transaction {
    /// - Started goes to the receiver's bank, which must confirm or fail it.
    /// - Confirmed goes to the sender's bank, which must complete or fail it.
    /// - Completed goes to the receiver's bank as the final notice.
    /// - Failed goes to both banks, since either side may have issued it.
    fn route(&self, event: &TransactionEvent) -> Vec<Destination> {
        let kind = EventKind::of(event);
        let banks = match kind {
            EventKind::Started | EventKind::Completed => vec![self.receiver_bank()],
            EventKind::Confirmed => vec![self.sender_bank()],
            EventKind::Failed => vec![self.sender_bank(), self.receiver_bank()],
        };

        let mut out: Vec<Destination> = Vec::with_capacity(banks.len());
        for bank in banks.into_iter().flatten() {
            let dest = kind.destination(bank);
            if !out.contains(&dest) {
                out.push(dest);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::*;
    use chrono::Utc;
    use instapay_core::{AccountId, Aggregate, AggregateId};

    fn started(sender_bank: BankId, receiver_bank: BankId) -> (Transaction, TransactionEvent) {
        let id = TransactionId::new(AggregateId::new());
        let ev = TransactionEvent::Started(TransactionStarted {
            transaction_id: id,
            sender: AccountId::new(),
            sender_bank,
            receiver: AccountId::new(),
            receiver_bank,
            amount: 10,
            description: String::new(),
            occurred_at: Utc::now(),
        });
        let mut tx = Transaction::empty(id);
        tx.apply(&ev);
        (tx, ev)
    }

    #[test]
    fn started_goes_to_receiver_and_confirmed_to_sender() {
        let (a, b) = (BankId::new(), BankId::new());
        let (tx, ev) = started(a, b);
        assert_eq!(tx.route(&ev), vec![EventKind::Started.destination(b)]);

        let confirmed = TransactionEvent::Confirmed(TransactionConfirmed {
            transaction_id: tx.id_typed(),
            occurred_at: Utc::now(),
        });
        assert_eq!(tx.route(&confirmed), vec![EventKind::Confirmed.destination(a)]);
    }

    #[test]
    fn failed_goes_to_both_banks_once() {
        let (a, b) = (BankId::new(), BankId::new());
        let (tx, _) = started(a, b);
        let failed = TransactionEvent::Failed(TransactionFailed {
            transaction_id: tx.id_typed(),
            reason: "timeout".into(),
            occurred_at: Utc::now(),
        });
        assert_eq!(tx.route(&failed).len(), 2);

        let (same_bank, _) = started(a, a);
        assert_eq!(same_bank.route(&failed), vec![EventKind::Failed.destination(a)]);
    }

    #[test]
    fn kind_parses_from_path_segment() {
        assert_eq!("confirmed".parse::<EventKind>().unwrap(), EventKind::Confirmed);
        assert!("settled".parse::<EventKind>().is_err());
    }
}
