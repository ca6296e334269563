//! Account and payment-key registry.
//!
//! Resolves the identifiers people type (an account number or a payment key)
//! to the internal `(account, bank)` pair a transaction needs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use instapay_core::{AccountId, BankId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: AccountId,
    pub bank_id: BankId,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Resolve a payment key, falling back to an account number.
    async fn resolve_key(&self, key: &str) -> Result<AccountRef, RegistryError>;

    /// Look up the bank that holds `account_id`.
    async fn resolve_account(&self, account_id: AccountId) -> Result<AccountRef, RegistryError>;
}

#[async_trait]
impl<R> KeyRegistry for std::sync::Arc<R>
where
    R: KeyRegistry + ?Sized,
{
    async fn resolve_key(&self, key: &str) -> Result<AccountRef, RegistryError> {
        (**self).resolve_key(key).await
    }

    async fn resolve_account(&self, account_id: AccountId) -> Result<AccountRef, RegistryError> {
        (**self).resolve_account(account_id).await
    }
}

#[derive(Debug, Default)]
struct Entries {
    accounts: HashMap<AccountId, AccountRef>,
    numbers: HashMap<String, AccountId>,
    keys: HashMap<String, AccountId>,
}

/// In-memory registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryKeyRegistry {
    entries: RwLock<Entries>,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_account(
        &self,
        account_id: AccountId,
        bank_id: BankId,
        number: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RegistryError::Storage("lock poisoned".to_string()))?;
        entries.accounts.insert(account_id, AccountRef { account_id, bank_id });
        entries.numbers.insert(number.into(), account_id);
        Ok(())
    }

    /// Attach a payment key to a registered account.
    pub fn register_key(&self, key: impl Into<String>, account_id: AccountId) -> Result<(), RegistryError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RegistryError::Storage("lock poisoned".to_string()))?;
        if !entries.accounts.contains_key(&account_id) {
            return Err(RegistryError::NotFound(format!("account {account_id}")));
        }
        entries.keys.insert(key.into(), account_id);
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn resolve_key(&self, key: &str) -> Result<AccountRef, RegistryError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RegistryError::Storage("lock poisoned".to_string()))?;
        entries
            .keys
            .get(key)
            .or_else(|| entries.numbers.get(key))
            .and_then(|id| entries.accounts.get(id))
            .copied()
            .ok_or_else(|| RegistryError::NotFound(format!("key {key}")))
    }

    async fn resolve_account(&self, account_id: AccountId) -> Result<AccountRef, RegistryError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RegistryError::Storage("lock poisoned".to_string()))?;
        entries
            .accounts
            .get(&account_id)
            .copied()
            .ok_or_else(|| RegistryError::NotFound(format!("account {account_id}")))
    }
}

/// Registry over the `accounts` and `pix_keys` tables created by
/// `PostgresEventStore::init_schema`.
#[derive(Debug, Clone)]
pub struct PostgresKeyRegistry {
    pool: PgPool,
}

impl PostgresKeyRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_ref(row: &sqlx::postgres::PgRow) -> Result<AccountRef, RegistryError> {
        let account_id: Uuid = row.try_get("account_id").map_err(storage)?;
        let bank_id: Uuid = row.try_get("bank_id").map_err(storage)?;
        Ok(AccountRef {
            account_id: AccountId::from_uuid(account_id),
            bank_id: BankId::from_uuid(bank_id),
        })
    }
}

fn storage(err: sqlx::Error) -> RegistryError {
    RegistryError::Storage(err.to_string())
}

#[async_trait]
impl KeyRegistry for PostgresKeyRegistry {
    #[instrument(skip(self), err)]
    async fn resolve_key(&self, key: &str) -> Result<AccountRef, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT a.account_id, a.bank_id
            FROM accounts a
            LEFT JOIN pix_keys k ON k.account_id = a.account_id AND k.key = $1
            WHERE k.key IS NOT NULL OR a.number = $1
            ORDER BY (k.key IS NOT NULL) DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Self::row_to_ref(&row),
            None => Err(RegistryError::NotFound(format!("key {key}"))),
        }
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn resolve_account(&self, account_id: AccountId) -> Result<AccountRef, RegistryError> {
        let row = sqlx::query("SELECT account_id, bank_id FROM accounts WHERE account_id = $1")
            .bind(*account_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => Self::row_to_ref(&row),
            None => Err(RegistryError::NotFound(format!("account {account_id}"))),
        }
    }
}
