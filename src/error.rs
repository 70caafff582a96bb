// Error taxonomy for the service
// Every flow outcome that is not a success is one of these variants

use thiserror::Error;

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Errors raised by an [`crate::store::AccountStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint on identity rejected the insert.
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),

    /// Error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row could not be turned back into an account.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Adjustment would take the balance outside the i64 range.
    #[error("credit adjustment of {delta} overflows the balance of {identity}")]
    CreditOverflow { identity: String, delta: i64 },

    /// Connection mutex was poisoned by a panicking holder.
    #[error("store lock poisoned")]
    Poisoned,
}

// ============================================================================
// SIMILARITY ENGINE ERRORS
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("input of {len} characters exceeds the limit of {limit}")]
    InputTooLarge { len: usize, limit: usize },

    #[error("engine produced a non-finite score")]
    NonFinite,

    #[error("engine failure: {0}")]
    Engine(String),
}

// ============================================================================
// SERVICE ERRORS
// ============================================================================

/// Outcome of a flow that did not succeed.
///
/// Each variant maps to exactly one symbolic status code, see
/// [`ServiceError::status_code`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("user already exists")]
    IdentityConflict,

    #[error("user not found")]
    UserNotFound,

    #[error("incorrect password")]
    InvalidCredential,

    #[error("not enough tokens, please refill")]
    InsufficientCredits,

    #[error("incorrect admin password")]
    InvalidAdminCredential,

    /// `refunded` records whether the reserved credit was given back.
    #[error("similarity computation failed: {source}")]
    ExternalComputationFailure {
        source: SimilarityError,
        refunded: bool,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity(_) => ServiceError::IdentityConflict,
            StoreError::CreditOverflow { delta, .. } => ServiceError::MalformedRequest(format!(
                "adjusting credits by {} would overflow the balance",
                delta
            )),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl ServiceError {
    /// Symbolic status code carried in the response body.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::IdentityConflict => 301,
            ServiceError::InvalidCredential => 302,
            ServiceError::InsufficientCredits => 303,
            ServiceError::InvalidAdminCredential => 304,
            ServiceError::UserNotFound => 305,
            ServiceError::MalformedRequest(_) => 306,
            ServiceError::ExternalComputationFailure { .. } => 307,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Message safe to hand back to a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "Internal server error".to_string(),
            ServiceError::ExternalComputationFailure { refunded: true, .. } => {
                "Similarity computation failed, no tokens were charged".to_string()
            }
            ServiceError::ExternalComputationFailure { refunded: false, .. } => {
                "Similarity computation failed".to_string()
            }
            other => {
                let msg = other.to_string();
                let mut chars = msg.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => msg,
                }
            }
        }
    }
}

/// Result type for flow operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
