//! The three metered flows: registration, similarity detection and admin
//! refill. Each call is a self-contained transaction against the injected
//! [`AccountStore`]; nothing is kept in memory between requests.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::auth::{hash_secret, verify_secret, AdminSecret, AuthError};
use crate::error::{Result, ServiceError};
use crate::similarity::SimilarityEngine;
use crate::store::AccountStore;

/// Policy knobs for the flows.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub initial_credits: i64,
    pub allow_negative_refill: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            initial_credits: crate::account::INITIAL_CREDITS,
            allow_negative_refill: true,
        }
    }
}

/// Outcome of a successful detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub similarity: f64,
    pub remaining_credits: i64,
}

#[derive(Clone)]
pub struct SimilarityService {
    store: Arc<dyn AccountStore>,
    engine: Arc<dyn SimilarityEngine>,
    admin: AdminSecret,
    settings: ServiceSettings,
}

impl SimilarityService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        engine: Arc<dyn SimilarityEngine>,
        admin: AdminSecret,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            engine,
            admin,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Create an account for `identity` unless it is already taken.
    ///
    /// The lookup is only an early exit; the store's unique constraint is what
    /// decides concurrent registrations of the same identity.
    pub async fn register(&self, identity: &str, secret: &str) -> Result<Account> {
        if self.store.find_by_identity(identity).await?.is_some() {
            warn!(identity, "registration rejected: identity exists");
            return Err(ServiceError::IdentityConflict);
        }

        let credential_hash = hash_off_runtime(secret).await?;
        let account = Account::new(
            identity.to_string(),
            credential_hash,
            self.settings.initial_credits,
        );

        if let Err(err) = self.store.insert(&account).await {
            let err = ServiceError::from(err);
            match &err {
                ServiceError::IdentityConflict => {
                    warn!(identity, "registration lost race on unique identity")
                }
                other => error!(identity, error = %other, "failed to insert account"),
            }
            return Err(err);
        }

        info!(identity, credits = account.credits, "account registered");
        Ok(account)
    }

    // ========================================================================
    // DETECTION (metered)
    // ========================================================================

    /// Authenticate, spend one credit and score `text1` against `text2`.
    ///
    /// The credit is reserved before scoring and refunded if the engine
    /// fails, so a credit is only consumed by a completed comparison.
    pub async fn detect(
        &self,
        identity: &str,
        secret: &str,
        text1: &str,
        text2: &str,
    ) -> Result<Detection> {
        let account = self.authenticate(identity, secret).await?;

        if !account.has_credits() {
            info!(identity, credits = account.credits, "detection rejected: no credits");
            return Err(ServiceError::InsufficientCredits);
        }

        // Balance may have been drained by a concurrent request since the read
        if !self.store.try_consume_credit(identity).await? {
            info!(identity, "detection rejected: credits drained concurrently");
            return Err(ServiceError::InsufficientCredits);
        }

        debug!(
            identity,
            engine = self.engine.name(),
            len1 = text1.len(),
            len2 = text2.len(),
            "scoring texts"
        );

        let similarity = match self.engine.similarity(text1, text2) {
            Ok(score) => score,
            Err(engine_err) => {
                error!(identity, error = %engine_err, "similarity engine failed, refunding credit");
                let refunded = match self.store.adjust_credits(identity, 1).await {
                    Ok(refunded) => refunded,
                    Err(refund_err) => {
                        error!(identity, error = %refund_err, "credit refund failed");
                        false
                    }
                };
                return Err(ServiceError::ExternalComputationFailure {
                    source: engine_err,
                    refunded,
                });
            }
        };

        let remaining_credits = self
            .store
            .find_by_identity(identity)
            .await?
            .map(|a| a.credits)
            .unwrap_or(account.credits - 1);

        info!(identity, similarity, remaining_credits, "similarity computed");
        Ok(Detection {
            similarity,
            remaining_credits,
        })
    }

    async fn authenticate(&self, identity: &str, secret: &str) -> Result<Account> {
        let account = self
            .store
            .find_by_identity(identity)
            .await?
            .ok_or_else(|| {
                info!(identity, "unknown identity");
                ServiceError::UserNotFound
            })?;

        match verify_off_runtime(secret, &account.credential_hash).await? {
            Ok(()) => Ok(account),
            Err(AuthError::Mismatch) => {
                warn!(identity, "incorrect password");
                Err(ServiceError::InvalidCredential)
            }
            Err(other) => {
                error!(identity, error = %other, "stored credential unusable");
                Err(ServiceError::Internal(other.to_string()))
            }
        }
    }

    // ========================================================================
    // REFILL (admin)
    // ========================================================================

    /// Adjust `identity`'s credits by `amount`, gated by the admin secret.
    ///
    /// Returns the balance after the adjustment. Negative amounts are allowed
    /// unless disabled in the settings, and may take the balance below zero.
    pub async fn refill(&self, identity: &str, admin_secret: &str, amount: i64) -> Result<i64> {
        if self.store.find_by_identity(identity).await?.is_none() {
            info!(identity, "refill rejected: unknown identity");
            return Err(ServiceError::UserNotFound);
        }

        if !self.admin.matches(admin_secret) {
            warn!(identity, "refill rejected: incorrect admin password");
            return Err(ServiceError::InvalidAdminCredential);
        }

        if amount < 0 && !self.settings.allow_negative_refill {
            return Err(ServiceError::MalformedRequest(
                "refill amount must not be negative".to_string(),
            ));
        }

        if !self.store.adjust_credits(identity, amount).await? {
            return Err(ServiceError::UserNotFound);
        }

        let credits = self
            .store
            .find_by_identity(identity)
            .await?
            .map(|a| a.credits)
            .ok_or(ServiceError::UserNotFound)?;

        info!(identity, amount, credits, "credits refilled");
        Ok(credits)
    }
}

// Argon2 runs on the blocking pool so it never stalls the async workers.

async fn hash_off_runtime(secret: &str) -> Result<String> {
    let secret = secret.to_owned();
    tokio::task::spawn_blocking(move || hash_secret(&secret))
        .await
        .map_err(|e| ServiceError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(|e| ServiceError::Internal(e.to_string()))
}

async fn verify_off_runtime(
    secret: &str,
    hash: &str,
) -> Result<std::result::Result<(), AuthError>> {
    let secret = secret.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
        .await
        .map_err(|e| ServiceError::Internal(format!("verification task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteAccountStore;
    use crate::error::{SimilarityError, StoreError};
    use crate::similarity::LexicalSimilarity;
    use crate::store::{MemoryAccountStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store with switchable misbehaviour.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryAccountStore,
        // Lookups miss, as when another registration commits in between
        stale_lookups: bool,
        fail_adjust: bool,
    }

    #[async_trait]
    impl AccountStore for FlakyStore {
        async fn find_by_identity(&self, identity: &str) -> StoreResult<Option<Account>> {
            if self.stale_lookups {
                return Ok(None);
            }
            self.inner.find_by_identity(identity).await
        }

        async fn insert(&self, account: &Account) -> StoreResult<()> {
            self.inner.insert(account).await
        }

        async fn adjust_credits(&self, identity: &str, delta: i64) -> StoreResult<bool> {
            if self.fail_adjust {
                return Err(StoreError::Poisoned);
            }
            self.inner.adjust_credits(identity, delta).await
        }

        async fn try_consume_credit(&self, identity: &str) -> StoreResult<bool> {
            self.inner.try_consume_credit(identity).await
        }

        async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
            self.inner.list_accounts().await
        }
    }

    struct FailingEngine;

    impl SimilarityEngine for FailingEngine {
        fn similarity(&self, _: &str, _: &str) -> std::result::Result<f64, SimilarityError> {
            Err(SimilarityError::Engine("model unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn service_with(
        engine: Arc<dyn SimilarityEngine>,
        settings: ServiceSettings,
    ) -> (SimilarityService, Arc<MemoryAccountStore>) {
        let store = Arc::new(MemoryAccountStore::new());
        let service = SimilarityService::new(
            store.clone(),
            engine,
            AdminSecret::new("admin"),
            settings,
        );
        (service, store)
    }

    fn service() -> (SimilarityService, Arc<MemoryAccountStore>) {
        service_with(
            Arc::new(LexicalSimilarity::default()),
            ServiceSettings::default(),
        )
    }

    async fn credits(store: &MemoryAccountStore, identity: &str) -> i64 {
        store
            .find_by_identity(identity)
            .await
            .unwrap()
            .unwrap()
            .credits
    }

    #[tokio::test]
    async fn test_register_twice() {
        let (service, store) = service();

        let account = service.register("alice", "pw1").await.unwrap();
        assert_eq!(account.credits, 6);
        assert_ne!(account.credential_hash, "pw1");

        let err = service.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, ServiceError::IdentityConflict));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_detect_decrements_by_one() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();

        let detection = service
            .detect("alice", "pw1", "cats are great", "cats are wonderful")
            .await
            .unwrap();

        assert!(detection.similarity > 0.5);
        assert_eq!(detection.remaining_credits, 5);
        assert_eq!(credits(&store, "alice").await, 5);
    }

    #[tokio::test]
    async fn test_detect_empty_and_identical_texts() {
        let (service, _) = service();
        service.register("alice", "pw1").await.unwrap();

        let empty = service.detect("alice", "pw1", "", "").await.unwrap();
        assert!((0.0..=1.0).contains(&empty.similarity));

        let same = service
            .detect("alice", "pw1", "same words here", "same words here")
            .await
            .unwrap();
        assert!((same.similarity - 1.0).abs() < 1e-9);
        assert_eq!(same.remaining_credits, 4);
    }

    #[tokio::test]
    async fn test_detect_unknown_user() {
        let (service, _) = service();
        let err = service.detect("ghost", "pw", "a", "b").await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound));
    }

    #[tokio::test]
    async fn test_detect_wrong_secret_leaves_credits() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();

        let err = service.detect("alice", "nope", "a", "b").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredential));
        assert_eq!(credits(&store, "alice").await, 6);
    }

    #[tokio::test]
    async fn test_detect_without_credits() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();
        store.adjust_credits("alice", -6).await.unwrap();

        let err = service.detect("alice", "pw1", "a", "b").await.unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientCredits));
        assert_eq!(credits(&store, "alice").await, 0);
    }

    #[tokio::test]
    async fn test_engine_failure_refunds_credit() {
        let (service, store) = service_with(Arc::new(FailingEngine), ServiceSettings::default());
        service.register("alice", "pw1").await.unwrap();

        let err = service.detect("alice", "pw1", "a", "b").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ExternalComputationFailure { refunded: true, .. }
        ));
        assert!(err.public_message().contains("no tokens were charged"));
        assert_eq!(credits(&store, "alice").await, 6);
    }

    #[tokio::test]
    async fn test_failed_refund_is_reported() {
        let store = Arc::new(FlakyStore {
            fail_adjust: true,
            ..FlakyStore::default()
        });
        let service = SimilarityService::new(
            store.clone(),
            Arc::new(FailingEngine),
            AdminSecret::new("admin"),
            ServiceSettings::default(),
        );
        service.register("alice", "pw1").await.unwrap();

        let err = service.detect("alice", "pw1", "a", "b").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ExternalComputationFailure { refunded: false, .. }
        ));
        assert!(!err.public_message().contains("no tokens"));
        assert_eq!(err.status_code(), 307);
        assert_eq!(credits(&store.inner, "alice").await, 5);
    }

    #[tokio::test]
    async fn test_register_race_lost_at_insert() {
        let store = Arc::new(FlakyStore {
            stale_lookups: true,
            ..FlakyStore::default()
        });
        store
            .inner
            .insert(&Account::new("alice".into(), "winner".into(), 6))
            .await
            .unwrap();
        let service = SimilarityService::new(
            store.clone(),
            Arc::new(LexicalSimilarity::default()),
            AdminSecret::new("admin"),
            ServiceSettings::default(),
        );

        let err = service.register("alice", "pw2").await.unwrap_err();
        assert!(matches!(err, ServiceError::IdentityConflict));
        assert_eq!(store.inner.len(), 1);

        let kept = store.inner.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(kept.credential_hash, "winner");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_hashing_does_not_stall_the_runtime() {
        let (service, _) = service();
        let done = AtomicBool::new(false);

        let register = async {
            let result = service.register("alice", "pw1").await;
            done.store(true, Ordering::SeqCst);
            result
        };
        let ticker = async {
            let mut ticks = 0u64;
            while !done.load(Ordering::SeqCst) {
                ticks += 1;
                tokio::task::yield_now().await;
            }
            ticks
        };

        let (result, ticks) = tokio::join!(register, ticker);
        result.unwrap();
        assert!(ticks > 1, "runtime was blocked while hashing ({ticks} ticks)");
    }

    #[tokio::test]
    async fn test_refill_positive_and_negative() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();

        assert_eq!(service.refill("alice", "admin", 10).await.unwrap(), 16);
        assert_eq!(service.refill("alice", "admin", -20).await.unwrap(), -4);
        assert_eq!(service.refill("alice", "admin", 0).await.unwrap(), -4);
        assert_eq!(credits(&store, "alice").await, -4);
    }

    #[tokio::test]
    async fn test_refill_wrong_admin_secret() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();

        let err = service.refill("alice", "pw1", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAdminCredential));
        assert_eq!(credits(&store, "alice").await, 6);
    }

    #[tokio::test]
    async fn test_refill_unknown_user_checked_first() {
        let (service, _) = service();
        let err = service.refill("ghost", "wrong", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound));
    }

    #[tokio::test]
    async fn test_negative_refill_policy() {
        let settings = ServiceSettings {
            allow_negative_refill: false,
            ..ServiceSettings::default()
        };
        let (service, store) = service_with(Arc::new(LexicalSimilarity::default()), settings);
        service.register("alice", "pw1").await.unwrap();

        let err = service.refill("alice", "admin", -1).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedRequest(_)));
        assert_eq!(credits(&store, "alice").await, 6);

        assert_eq!(service.refill("alice", "admin", 4).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_overflowing_refill_on_sqlite_is_rejected() {
        let store = Arc::new(SqliteAccountStore::open_memory().unwrap());
        let service = SimilarityService::new(
            store.clone(),
            Arc::new(LexicalSimilarity::default()),
            AdminSecret::new("admin"),
            ServiceSettings::default(),
        );
        service.register("alice", "pw1").await.unwrap();

        let err = service.refill("alice", "admin", i64::MAX).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedRequest(_)));
        assert_eq!(err.status_code(), 306);

        // Account is still readable and usable
        let detection = service.detect("alice", "pw1", "a b", "a b").await.unwrap();
        assert_eq!(detection.remaining_credits, 5);
        assert_eq!(service.refill("alice", "admin", 10).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_alice_scenario() {
        let (service, _) = service();

        service.register("alice", "pw1").await.unwrap();
        let detection = service
            .detect("alice", "pw1", "cats are great", "cats are wonderful")
            .await
            .unwrap();
        assert!(detection.similarity > 0.5);
        assert_eq!(detection.remaining_credits, 5);

        assert_eq!(service.refill("alice", "admin", 10).await.unwrap(), 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_detects_spend_exactly_balance() {
        let (service, store) = service();
        service.register("alice", "pw1").await.unwrap();
        store.adjust_credits("alice", 2).await.unwrap(); // 8 credits

        let mut handles = Vec::new();
        for i in 0..10 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .detect("alice", "pw1", "some text", &format!("other text {}", i))
                    .await
            }));
        }

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(ServiceError::InsufficientCredits) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(ok, 8);
        assert_eq!(rejected, 2);
        assert_eq!(credits(&store, "alice").await, 0);
    }
}
