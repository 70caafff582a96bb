//! Credential primitives: salted one-way hashing of account secrets and the
//! constant-time check of the administrative secret.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("failed to hash secret: {0}")]
    Hashing(String),

    #[error("stored credential hash is malformed")]
    MalformedHash,

    #[error("secret does not match")]
    Mismatch,
}

/// Hash a secret with Argon2id and a fresh random salt.
///
/// Returns the PHC string, which embeds algorithm, parameters and salt.
pub fn hash_secret(secret: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Verify a secret against a PHC hash produced by [`hash_secret`].
pub fn verify_secret(secret: &str, credential_hash: &str) -> Result<(), AuthError> {
    let parsed = PasswordHash::new(credential_hash).map_err(|_| AuthError::MalformedHash)?;

    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .map_err(|_| AuthError::Mismatch)
}

/// The administrative secret gating credit refills.
///
/// Only the SHA-256 digest is kept, so comparisons run over fixed-length
/// inputs regardless of what the caller sends.
#[derive(Clone)]
pub struct AdminSecret {
    digest: [u8; 32],
}

impl AdminSecret {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    /// Constant-time equality against a candidate secret.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.digest.ct_eq(&candidate).into()
    }
}

impl std::fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminSecret(<redacted>)")
    }
}
