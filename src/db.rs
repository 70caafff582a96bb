// SQLite account store
// Schema setup plus the AccountStore implementation used in production

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::account::Account;
use crate::error::StoreError;
use crate::store::{AccountStore, StoreResult};

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Accounts Table
    // identity carries the UNIQUE constraint that decides registration races
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_uuid TEXT UNIQUE NOT NULL,
            identity TEXT UNIQUE NOT NULL,
            credential_hash TEXT NOT NULL,
            credits INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_identity ON accounts(identity)",
        [],
    )?;

    Ok(())
}

/// SQLite-backed [`AccountStore`].
///
/// Thread-safe via an internal Mutex; clones share the same connection.
#[derive(Clone)]
pub struct SqliteAccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAccountStore {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let created_at_idx = row.as_ref().column_index("created_at")?;
    let created_at_str: String = row.get(created_at_idx)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                created_at_idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?
        .with_timezone(&Utc);

    Ok(Account {
        id: row.get("account_uuid")?,
        identity: row.get("identity")?,
        credential_hash: row.get("credential_hash")?,
        credits: row.get("credits")?,
        created_at,
    })
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn find_by_identity(&self, identity: &str) -> StoreResult<Option<Account>> {
        self.with_conn(|conn| {
            let account = conn
                .query_row(
                    "SELECT account_uuid, identity, credential_hash, credits, created_at
                     FROM accounts WHERE identity = ?1",
                    params![identity],
                    row_to_account,
                )
                .optional()?;
            Ok(account)
        })
    }

    async fn insert(&self, account: &Account) -> StoreResult<()> {
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO accounts (
                    account_uuid, identity, credential_hash, credits, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account.id,
                    account.identity,
                    account.credential_hash,
                    account.credits,
                    account.created_at.to_rfc3339(),
                ],
            );

            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateIdentity(account.identity.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn adjust_credits(&self, identity: &str, delta: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            // SQLite promotes an overflowing integer sum to REAL, so the bound
            // is checked before the addition happens.
            let changed = conn.execute(
                "UPDATE accounts SET credits = credits + ?1
                 WHERE identity = ?2
                   AND ((?1 >= 0 AND credits <= ?3 - ?1)
                     OR (?1 < 0 AND credits >= ?4 - ?1))",
                params![delta, identity, i64::MAX, i64::MIN],
            )?;
            if changed == 1 {
                return Ok(true);
            }

            let exists = conn
                .query_row(
                    "SELECT 1 FROM accounts WHERE identity = ?1",
                    params![identity],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            if exists {
                Err(StoreError::CreditOverflow {
                    identity: identity.to_string(),
                    delta,
                })
            } else {
                Ok(false)
            }
        })
    }

    async fn try_consume_credit(&self, identity: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE accounts SET credits = credits - 1
                 WHERE identity = ?1 AND credits > 0",
                params![identity],
            )?;
            Ok(changed == 1)
        })
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT account_uuid, identity, credential_hash, credits, created_at
                 FROM accounts
                 ORDER BY identity",
            )?;

            let accounts = stmt
                .query_map([], row_to_account)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(accounts)
        })
    }
}
