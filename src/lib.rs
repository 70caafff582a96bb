// Similarity Service - Core Library
// Exposes all modules for use in the API server, the operator CLI, and tests

pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod service;
pub mod similarity;
pub mod store;

// Re-export commonly used types
pub use account::{Account, INITIAL_CREDITS};
pub use api::{router, AppState};
pub use auth::{hash_secret, verify_secret, AdminSecret, AuthError};
pub use config::{Config, ConfigError};
pub use db::{setup_database, SqliteAccountStore};
pub use error::{ServiceError, SimilarityError, StoreError};
pub use logging::{init_logging, LogFormat};
pub use service::{Detection, ServiceSettings, SimilarityService};
pub use similarity::{LexicalSimilarity, SimilarityEngine};
pub use store::{AccountStore, MemoryAccountStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the service from a validated configuration and an opened store.
pub fn build_service(
    config: &Config,
    store: std::sync::Arc<dyn AccountStore>,
) -> Result<SimilarityService, ConfigError> {
    config.validate()?;
    let admin_secret = config
        .admin
        .secret
        .as_deref()
        .ok_or(ConfigError::MissingAdminSecret)?;

    Ok(SimilarityService::new(
        store,
        std::sync::Arc::new(LexicalSimilarity::new(config.similarity.max_input_chars)),
        AdminSecret::new(admin_secret),
        ServiceSettings {
            initial_credits: config.credits.initial,
            allow_negative_refill: config.credits.allow_negative_refill,
        },
    ))
}
