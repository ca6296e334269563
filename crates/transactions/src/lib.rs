//! `instapay-transactions` — the instant-payment Transaction aggregate.
//!
//! A transaction is settled by two banks that share nothing but this event
//! stream: the sender's bank starts and completes it, the receiver's bank
//! confirms it, and either side can fail it while it is in flight.

pub mod routing;
pub mod transaction;

pub use routing::{EventKind, PROJECTION_PARTITION, PROJECTION_TOPIC, projection_destination};
pub use transaction::{
    CompleteTransaction, ConfirmTransaction, FailTransaction, MAX_DESCRIPTION_LEN,
    StartTransaction, Transaction, TransactionCommand, TransactionCompleted, TransactionConfirmed,
    TransactionEvent, TransactionFailed, TransactionId, TransactionStarted, TransactionStatus,
};
