//! Store trait: the abstract interface for account persistence.
//!
//! Flows only ever talk to [`AccountStore`]. The SQLite backend lives in
//! [`crate::db`]; [`MemoryAccountStore`] keeps everything in memory and is
//! used by tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::account::Account;
use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Async interface for account persistence.
///
/// Credit mutations must be single atomic operations in the backend; callers
/// never read-modify-write the balance.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Exact-match lookup, no case normalization.
    async fn find_by_identity(&self, identity: &str) -> StoreResult<Option<Account>>;

    /// Insert a new account.
    ///
    /// Fails with [`StoreError::DuplicateIdentity`] when the identity is taken,
    /// including when a concurrent registration won the race.
    async fn insert(&self, account: &Account) -> StoreResult<()>;

    /// Atomically apply `credits += delta`. No floor is enforced.
    ///
    /// Returns `false` when no account has this identity. Fails with
    /// [`StoreError::CreditOverflow`], leaving the balance untouched, when the
    /// sum does not fit in an `i64`.
    async fn adjust_credits(&self, identity: &str, delta: i64) -> StoreResult<bool>;

    /// Atomically take one credit if the balance is positive.
    ///
    /// Returns `false` when the balance was already ≤ 0 or the account is
    /// missing; nothing is changed in that case.
    async fn try_consume_credit(&self, identity: &str) -> StoreResult<bool>;

    /// All accounts ordered by identity.
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory store. All data is lost when dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_identity(&self, identity: &str) -> StoreResult<Option<Account>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::Poisoned)?;
        Ok(accounts.get(identity).cloned())
    }

    async fn insert(&self, account: &Account) -> StoreResult<()> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;

        if accounts.contains_key(&account.identity) {
            return Err(StoreError::DuplicateIdentity(account.identity.clone()));
        }

        accounts.insert(account.identity.clone(), account.clone());
        Ok(())
    }

    async fn adjust_credits(&self, identity: &str, delta: i64) -> StoreResult<bool> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;

        match accounts.get_mut(identity) {
            Some(account) => {
                account.credits = account.credits.checked_add(delta).ok_or_else(|| {
                    StoreError::CreditOverflow {
                        identity: identity.to_string(),
                        delta,
                    }
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_consume_credit(&self, identity: &str) -> StoreResult<bool> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::Poisoned)?;

        match accounts.get_mut(identity) {
            Some(account) if account.credits > 0 => {
                account.credits -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::Poisoned)?;

        let mut all: Vec<Account> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(all)
    }
}
