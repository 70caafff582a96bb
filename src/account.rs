// Account record - one per registered identity
// Identity is the lookup key, id is the stable row identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credits granted to a freshly registered account.
pub const INITIAL_CREDITS: i64 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identity (UUID) - never changes
    pub id: String,

    /// Login name, unique across all accounts, exact match
    pub identity: String,

    /// PHC-encoded Argon2id hash of the account secret
    #[serde(skip_serializing, default)]
    pub credential_hash: String,

    /// Remaining usage credits
    pub credits: i64,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with a fresh UUID
    pub fn new(identity: String, credential_hash: String, credits: i64) -> Self {
        Account {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            credential_hash,
            credits,
            created_at: Utc::now(),
        }
    }

    /// Whether the balance authorizes one more metered operation
    pub fn has_credits(&self) -> bool {
        self.credits > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_creation() {
        let account = Account::new("alice".to_string(), "$argon2id$...".to_string(), INITIAL_CREDITS);

        assert_eq!(account.identity, "alice");
        assert_eq!(account.credits, 6);
        assert_eq!(account.id.len(), 36);
        assert!(account.has_credits());
    }

    #[test]
    fn test_has_credits_boundary() {
        let mut account = Account::new("bob".to_string(), String::new(), 1);
        assert!(account.has_credits());

        account.credits = 0;
        assert!(!account.has_credits());

        account.credits = -3;
        assert!(!account.has_credits());
    }

    #[test]
    fn test_hash_never_serialized() {
        let account = Account::new("carol".to_string(), "secret-hash".to_string(), 6);
        let json = serde_json::to_string(&account).unwrap();

        assert!(!json.contains("secret-hash"));
        assert!(json.contains("\"credits\":6"));
    }
}
