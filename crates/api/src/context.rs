use instapay_core::BankId;

/// Authenticated bank for a request.
///
/// Inserted by the auth middleware; every command is issued by, and every
/// query is scoped to, this bank.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BankContext {
    bank_id: BankId,
}

impl BankContext {
    pub fn new(bank_id: BankId) -> Self {
        Self { bank_id }
    }

    pub fn bank_id(&self) -> BankId {
        self.bank_id
    }
}
