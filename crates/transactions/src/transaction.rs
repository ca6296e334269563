use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use instapay_core::{AccountId, Aggregate, AggregateId, AggregateRoot, BankId, DomainError, DomainResult};
use instapay_events::{Command, Event};

/// Longest accepted payment description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 140;

/// Transaction identifier, chosen by the sender.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub AggregateId);

impl TransactionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle: `Unstarted -> Started -> Confirmed -> {Completed | Failed}`.
///
/// `Failed` is also reachable straight from `Started`. `Unstarted` is the
/// state of an aggregate with no events and is never persisted.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Unstarted,
    Started,
    Confirmed,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Unstarted => "unstarted",
            TransactionStatus::Started => "started",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }
}

impl core::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
    sender: Option<AccountId>,
    sender_bank: Option<BankId>,
    receiver: Option<AccountId>,
    receiver_bank: Option<BankId>,
    amount: u64,
    description: String,
    status: TransactionStatus,
    reason_for_failing: Option<String>,
    version: u64,
}

impl Transaction {
    /// Create an empty, not-yet-started aggregate instance for rehydration.
    pub fn empty(id: TransactionId) -> Self {
        Self {
            id,
            sender: None,
            sender_bank: None,
            receiver: None,
            receiver_bank: None,
            amount: 0,
            description: String::new(),
            status: TransactionStatus::Unstarted,
            reason_for_failing: None,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn sender(&self) -> Option<AccountId> {
        self.sender
    }

    pub fn sender_bank(&self) -> Option<BankId> {
        self.sender_bank
    }

    pub fn receiver(&self) -> Option<AccountId> {
        self.receiver
    }

    pub fn receiver_bank(&self) -> Option<BankId> {
        self.receiver_bank
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn reason_for_failing(&self) -> Option<&str> {
        self.reason_for_failing.as_deref()
    }

    /// Whether `bank` is the sender's or the receiver's bank.
    pub fn is_party(&self, bank: BankId) -> bool {
        self.sender_bank == Some(bank) || self.receiver_bank == Some(bank)
    }
}

impl AggregateRoot for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartTransaction.
///
/// `issuer_bank` is the authenticated caller; `sender_bank` is the bank that
/// owns the `sender` account. The two must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTransaction {
    pub transaction_id: TransactionId,
    pub issuer_bank: BankId,
    pub sender: AccountId,
    pub sender_bank: BankId,
    pub receiver: AccountId,
    pub receiver_bank: BankId,
    pub amount: u64,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmTransaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmTransaction {
    pub transaction_id: TransactionId,
    pub issuer_bank: BankId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteTransaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTransaction {
    pub transaction_id: TransactionId,
    pub issuer_bank: BankId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailTransaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailTransaction {
    pub transaction_id: TransactionId,
    pub issuer_bank: BankId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionCommand {
    Start(StartTransaction),
    Confirm(ConfirmTransaction),
    Complete(CompleteTransaction),
    Fail(FailTransaction),
}

impl TransactionCommand {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionCommand::Start(c) => c.transaction_id,
            TransactionCommand::Confirm(c) => c.transaction_id,
            TransactionCommand::Complete(c) => c.transaction_id,
            TransactionCommand::Fail(c) => c.transaction_id,
        }
    }

    pub fn issuer_bank(&self) -> BankId {
        match self {
            TransactionCommand::Start(c) => c.issuer_bank,
            TransactionCommand::Confirm(c) => c.issuer_bank,
            TransactionCommand::Complete(c) => c.issuer_bank,
            TransactionCommand::Fail(c) => c.issuer_bank,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionCommand::Start(_) => "start",
            TransactionCommand::Confirm(_) => "confirm",
            TransactionCommand::Complete(_) => "complete",
            TransactionCommand::Fail(_) => "fail",
        }
    }
}

impl Command for TransactionCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.transaction_id().0
    }
}

/// Event: TransactionStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStarted {
    pub transaction_id: TransactionId,
    pub sender: AccountId,
    pub sender_bank: BankId,
    pub receiver: AccountId,
    pub receiver_bank: BankId,
    pub amount: u64,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransactionConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfirmed {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransactionCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCompleted {
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransactionFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFailed {
    pub transaction_id: TransactionId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionEvent {
    Started(TransactionStarted),
    Confirmed(TransactionConfirmed),
    Completed(TransactionCompleted),
    Failed(TransactionFailed),
}

impl TransactionEvent {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionEvent::Started(e) => e.transaction_id,
            TransactionEvent::Confirmed(e) => e.transaction_id,
            TransactionEvent::Completed(e) => e.transaction_id,
            TransactionEvent::Failed(e) => e.transaction_id,
        }
    }
}

impl Event for TransactionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::Started(_) => "transaction.started",
            TransactionEvent::Confirmed(_) => "transaction.confirmed",
            TransactionEvent::Completed(_) => "transaction.completed",
            TransactionEvent::Failed(_) => "transaction.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransactionEvent::Started(e) => e.occurred_at,
            TransactionEvent::Confirmed(e) => e.occurred_at,
            TransactionEvent::Completed(e) => e.occurred_at,
            TransactionEvent::Failed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Transaction {
    type Command = TransactionCommand;
    type Event = TransactionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransactionEvent::Started(e) => {
                self.id = e.transaction_id;
                self.sender = Some(e.sender);
                self.sender_bank = Some(e.sender_bank);
                self.receiver = Some(e.receiver);
                self.receiver_bank = Some(e.receiver_bank);
                self.amount = e.amount;
                self.description = e.description.clone();
                self.status = TransactionStatus::Started;
            }
            TransactionEvent::Confirmed(_) => {
                self.status = TransactionStatus::Confirmed;
            }
            TransactionEvent::Completed(_) => {
                self.status = TransactionStatus::Completed;
            }
            TransactionEvent::Failed(e) => {
                self.status = TransactionStatus::Failed;
                self.reason_for_failing = Some(e.reason.clone());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.transaction_id() != self.id {
            return Err(DomainError::validation("transaction_id mismatch"));
        }
        match command {
            TransactionCommand::Start(cmd) => self.handle_start(cmd),
            TransactionCommand::Confirm(cmd) => self.handle_confirm(cmd),
            TransactionCommand::Complete(cmd) => self.handle_complete(cmd),
            TransactionCommand::Fail(cmd) => self.handle_fail(cmd),
        }
    }
}

impl Transaction {
    // Status is checked before the issuer: a terminal or out-of-order command
    // is reported as such even when it also comes from the wrong bank.
    fn ensure_status(&self, command: &str, allowed: &[TransactionStatus]) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else if self.status == TransactionStatus::Unstarted {
            // Nothing was ever recorded under this id.
            Err(DomainError::not_found(format!("transaction {}", self.id)))
        } else {
            Err(DomainError::status_mismatch(command, self.status))
        }
    }

    fn handle_start(&self, cmd: &StartTransaction) -> DomainResult<Vec<TransactionEvent>> {
        self.ensure_status("start", &[TransactionStatus::Unstarted])?;
        if cmd.issuer_bank != cmd.sender_bank {
            return Err(DomainError::permission_denied(
                "only the sender's bank can start a transaction",
            ));
        }
        if cmd.amount == 0 {
            return Err(DomainError::validation("amount must be greater than zero"));
        }
        if cmd.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(DomainError::validation(format!(
                "description cannot exceed {MAX_DESCRIPTION_LEN} characters"
            )));
        }

        Ok(vec![TransactionEvent::Started(TransactionStarted {
            transaction_id: cmd.transaction_id,
            sender: cmd.sender,
            sender_bank: cmd.sender_bank,
            receiver: cmd.receiver,
            receiver_bank: cmd.receiver_bank,
            amount: cmd.amount,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(
        &self,
        cmd: &ConfirmTransaction,
    ) -> DomainResult<Vec<TransactionEvent>> {
        self.ensure_status("confirm", &[TransactionStatus::Started])?;
        if self.receiver_bank != Some(cmd.issuer_bank) {
            return Err(DomainError::permission_denied(
                "only the receiver's bank can confirm a transaction",
            ));
        }

        Ok(vec![TransactionEvent::Confirmed(TransactionConfirmed {
            transaction_id: cmd.transaction_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(
        &self,
        cmd: &CompleteTransaction,
    ) -> DomainResult<Vec<TransactionEvent>> {
        self.ensure_status("complete", &[TransactionStatus::Confirmed])?;
        if self.sender_bank != Some(cmd.issuer_bank) {
            return Err(DomainError::permission_denied(
                "only the sender's bank can complete a transaction",
            ));
        }

        Ok(vec![TransactionEvent::Completed(TransactionCompleted {
            transaction_id: cmd.transaction_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail(&self, cmd: &FailTransaction) -> DomainResult<Vec<TransactionEvent>> {
        self.ensure_status(
            "fail",
            &[TransactionStatus::Started, TransactionStatus::Confirmed],
        )?;
        if !self.is_party(cmd.issuer_bank) {
            return Err(DomainError::permission_denied(
                "only the sender's or receiver's bank can fail a transaction",
            ));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("reason cannot be empty"));
        }

        Ok(vec![TransactionEvent::Failed(TransactionFailed {
            transaction_id: cmd.transaction_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instapay_events::execute;
    use proptest::prelude::*;

    struct Parties {
        id: TransactionId,
        sender: AccountId,
        sender_bank: BankId,
        receiver: AccountId,
        receiver_bank: BankId,
        outsider: BankId,
    }

    fn parties() -> Parties {
        Parties {
            id: TransactionId::new(AggregateId::new()),
            sender: AccountId::new(),
            sender_bank: BankId::new(),
            receiver: AccountId::new(),
            receiver_bank: BankId::new(),
            outsider: BankId::new(),
        }
    }

    fn start(p: &Parties, issuer: BankId) -> TransactionCommand {
        TransactionCommand::Start(StartTransaction {
            transaction_id: p.id,
            issuer_bank: issuer,
            sender: p.sender,
            sender_bank: p.sender_bank,
            receiver: p.receiver,
            receiver_bank: p.receiver_bank,
            amount: 1_000,
            description: "rent".to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn confirm(p: &Parties, issuer: BankId) -> TransactionCommand {
        TransactionCommand::Confirm(ConfirmTransaction {
            transaction_id: p.id,
            issuer_bank: issuer,
            occurred_at: Utc::now(),
        })
    }

    fn complete(p: &Parties, issuer: BankId) -> TransactionCommand {
        TransactionCommand::Complete(CompleteTransaction {
            transaction_id: p.id,
            issuer_bank: issuer,
            occurred_at: Utc::now(),
        })
    }

    fn fail(p: &Parties, issuer: BankId) -> TransactionCommand {
        TransactionCommand::Fail(FailTransaction {
            transaction_id: p.id,
            issuer_bank: issuer,
            reason: "insufficient funds".to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn in_status(p: &Parties, status: TransactionStatus) -> Transaction {
        let mut tx = Transaction::empty(p.id);
        let steps: Vec<TransactionCommand> = match status {
            TransactionStatus::Unstarted => vec![],
            TransactionStatus::Started => vec![start(p, p.sender_bank)],
            TransactionStatus::Confirmed => {
                vec![start(p, p.sender_bank), confirm(p, p.receiver_bank)]
            }
            TransactionStatus::Completed => vec![
                start(p, p.sender_bank),
                confirm(p, p.receiver_bank),
                complete(p, p.sender_bank),
            ],
            TransactionStatus::Failed => vec![start(p, p.sender_bank), fail(p, p.receiver_bank)],
        };
        for cmd in &steps {
            execute(&mut tx, cmd).unwrap();
        }
        assert_eq!(tx.status(), status);
        tx
    }

    const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Unstarted,
        TransactionStatus::Started,
        TransactionStatus::Confirmed,
        TransactionStatus::Completed,
        TransactionStatus::Failed,
    ];

    const FROM_UNSTARTED: &[TransactionStatus] = &[TransactionStatus::Unstarted];
    const FROM_STARTED: &[TransactionStatus] = &[TransactionStatus::Started];
    const FROM_CONFIRMED: &[TransactionStatus] = &[TransactionStatus::Confirmed];
    const FROM_IN_FLIGHT: &[TransactionStatus] =
        &[TransactionStatus::Started, TransactionStatus::Confirmed];

    fn authorized_commands(p: &Parties) -> Vec<(TransactionCommand, &'static [TransactionStatus])> {
        vec![
            (start(p, p.sender_bank), FROM_UNSTARTED),
            (confirm(p, p.receiver_bank), FROM_STARTED),
            (complete(p, p.sender_bank), FROM_CONFIRMED),
            (fail(p, p.sender_bank), FROM_IN_FLIGHT),
            (fail(p, p.receiver_bank), FROM_IN_FLIGHT),
        ]
    }

    #[test]
    fn invariant_table_matches_for_authorized_issuers() {
        let p = parties();

        for status in ALL {
            let tx = in_status(&p, status);
            for (cmd, accepted_from) in authorized_commands(&p) {
                let result = tx.handle(&cmd);
                if accepted_from.contains(&status) {
                    let events = result.unwrap_or_else(|e| {
                        panic!("{} from {status} should be accepted, got {e:?}", cmd.name())
                    });
                    assert_eq!(events.len(), 1);
                } else if status == TransactionStatus::Unstarted {
                    assert!(
                        matches!(result, Err(DomainError::NotFound(_))),
                        "{} on an unknown transaction should be not found, got {result:?}",
                        cmd.name()
                    );
                } else {
                    assert!(
                        matches!(result, Err(DomainError::StatusMismatch { .. })),
                        "{} from {status} should be a status mismatch, got {result:?}",
                        cmd.name()
                    );
                }
            }
        }
    }

    #[test]
    fn invariant_table_rejects_unauthorized_issuers() {
        let p = parties();

        for status in ALL {
            let tx = in_status(&p, status);
            let wrong_issuer = [
                (start(&p, p.receiver_bank), TransactionStatus::Unstarted),
                (start(&p, p.outsider), TransactionStatus::Unstarted),
                (confirm(&p, p.sender_bank), TransactionStatus::Started),
                (confirm(&p, p.outsider), TransactionStatus::Started),
                (complete(&p, p.receiver_bank), TransactionStatus::Confirmed),
                (complete(&p, p.outsider), TransactionStatus::Confirmed),
            ];
            for (cmd, valid_status) in wrong_issuer {
                let result = tx.handle(&cmd);
                if status == valid_status {
                    assert!(
                        matches!(result, Err(DomainError::PermissionDenied(_))),
                        "{} from {status}: {result:?}",
                        cmd.name()
                    );
                } else if status == TransactionStatus::Unstarted {
                    assert!(matches!(result, Err(DomainError::NotFound(_))));
                } else {
                    assert!(matches!(result, Err(DomainError::StatusMismatch { .. })));
                }
            }

            let result = tx.handle(&fail(&p, p.outsider));
            match status {
                TransactionStatus::Started | TransactionStatus::Confirmed => {
                    assert!(matches!(result, Err(DomainError::PermissionDenied(_))))
                }
                TransactionStatus::Unstarted => {
                    assert!(matches!(result, Err(DomainError::NotFound(_))))
                }
                _ => assert!(matches!(result, Err(DomainError::StatusMismatch { .. }))),
            }
        }
    }

    #[test]
    fn rejected_command_does_not_mutate_state() {
        let p = parties();
        let mut tx = in_status(&p, TransactionStatus::Started);
        let before = tx.clone();

        assert!(execute(&mut tx, &complete(&p, p.sender_bank)).is_err());
        assert_eq!(tx, before);
    }

    #[test]
    fn happy_path_then_terminal() {
        let p = parties();
        let tx = in_status(&p, TransactionStatus::Completed);
        assert_eq!(tx.version(), 3);
        assert_eq!(tx.amount(), 1_000);
        assert_eq!(tx.sender_bank(), Some(p.sender_bank));

        assert!(matches!(
            tx.handle(&confirm(&p, p.receiver_bank)),
            Err(DomainError::StatusMismatch { .. })
        ));
        assert!(matches!(
            tx.handle(&fail(&p, p.sender_bank)),
            Err(DomainError::StatusMismatch { .. })
        ));
    }

    #[test]
    fn follow_up_on_unknown_transaction_is_not_found() {
        let p = parties();
        let tx = Transaction::empty(p.id);
        for cmd in [confirm(&p, p.receiver_bank), complete(&p, p.sender_bank), fail(&p, p.sender_bank)] {
            match tx.handle(&cmd) {
                Err(DomainError::NotFound(what)) => assert!(what.contains(&p.id.to_string())),
                other => panic!("{}: expected not found, got {other:?}", cmd.name()),
            }
        }
    }

    #[test]
    fn failed_records_reason() {
        let p = parties();
        let tx = in_status(&p, TransactionStatus::Failed);
        assert_eq!(tx.reason_for_failing(), Some("insufficient funds"));
        assert_eq!(tx.version(), 2);
    }

    #[test]
    fn start_validates_amount_and_description() {
        let p = parties();
        let tx = Transaction::empty(p.id);

        let TransactionCommand::Start(mut cmd) = start(&p, p.sender_bank) else {
            unreachable!()
        };
        cmd.amount = 0;
        assert!(matches!(
            tx.handle(&TransactionCommand::Start(cmd.clone())),
            Err(DomainError::Validation(_))
        ));

        cmd.amount = 5;
        cmd.description = "x".repeat(MAX_DESCRIPTION_LEN + 1);
        assert!(matches!(
            tx.handle(&TransactionCommand::Start(cmd)),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn command_for_other_transaction_is_rejected() {
        let p = parties();
        let tx = Transaction::empty(TransactionId::new(AggregateId::new()));
        assert!(matches!(
            tx.handle(&start(&p, p.sender_bank)),
            Err(DomainError::Validation(_))
        ));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start,
        Confirm,
        Complete,
        Fail,
    }

    #[derive(Debug, Clone, Copy)]
    enum Who {
        Sender,
        Receiver,
        Outsider,
    }

    fn op_strategy() -> impl Strategy<Value = (Op, Who)> {
        let op = prop_oneof![Just(Op::Start), Just(Op::Confirm), Just(Op::Complete), Just(Op::Fail)];
        let who = prop_oneof![Just(Who::Sender), Just(Who::Receiver), Just(Who::Outsider)];
        (op, who)
    }

    proptest! {
        #[test]
        fn replay_is_deterministic(ops in prop::collection::vec(op_strategy(), 0..24)) {
            let p = parties();
            let mut live = Transaction::empty(p.id);
            let mut history = Vec::new();

            for (op, who) in ops {
                let issuer = match who {
                    Who::Sender => p.sender_bank,
                    Who::Receiver => p.receiver_bank,
                    Who::Outsider => p.outsider,
                };
                let cmd = match op {
                    Op::Start => start(&p, issuer),
                    Op::Confirm => confirm(&p, issuer),
                    Op::Complete => complete(&p, issuer),
                    Op::Fail => fail(&p, issuer),
                };
                if let Ok(events) = execute(&mut live, &cmd) {
                    history.extend(events);
                }
            }

            prop_assert!(history.len() <= 3);
            prop_assert_eq!(live.version(), history.len() as u64);

            for _ in 0..2 {
                let mut replayed = Transaction::empty(p.id);
                for ev in &history {
                    replayed.apply(ev);
                }
                prop_assert_eq!(&replayed, &live);
            }
        }
    }
}
