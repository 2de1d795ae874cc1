//! Reusable helpers for the service-level integration tests.
//!
//! Builds an [`AuthService`] over the crate's in-memory stores with the test
//! configuration, plus utilities for seeding accounts, minting valid TOTP
//! codes, and inspecting the recorded audit trail.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;
use vantage_auth::config::Config;
use vantage_auth::password::hash_password;
use vantage_auth::service::AuthService;
use vantage_auth::store::{
    DeviceInfo, MemoryStore, RecordingMailer, Session, SessionStore, StoreError, UserStore,
};
use vantage_auth::user::{Role, User};

/// The concrete service type every integration test runs against
pub type TestService = AuthService<MemoryStore, MemoryStore, MemoryStore, RecordingMailer>;

/// Password used by every seeded account
pub const PASSWORD: &str = "correct-horse-battery-staple";

/// A service plus handles to its shared backing store and mailer
pub struct TestAuth {
    pub service: TestService,
    pub store: MemoryStore,
    pub mailer: RecordingMailer,
}

/// Surfaces library logs under RUST_LOG when a test needs debugging
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a service over fresh in-memory stores with the given configuration
pub fn build(config: Config) -> TestAuth {
    init_test_tracing();

    let store = MemoryStore::new();
    let mailer = RecordingMailer::new();
    let service = AuthService::new(
        config,
        store.clone(),
        store.clone(),
        store.clone(),
        mailer.clone(),
    )
    .expect("service should build from test config");
    TestAuth {
        service,
        store,
        mailer,
    }
}

/// Build with the stock test configuration
pub fn setup() -> TestAuth {
    build(Config::default_for_test())
}

/// Insert an active agent account with [`PASSWORD`]
pub async fn seed_user(auth: &TestAuth, email: &str) -> User {
    seed_user_into(&auth.store, email).await
}

/// Insert an active agent account with [`PASSWORD`] directly into a store
pub async fn seed_user_into(store: &MemoryStore, email: &str) -> User {
    let hash = hash_password(PASSWORD).expect("password should hash");
    let user = User::new(email, Some(hash), Role::Agent);
    store.insert_user(&user).await.expect("seed user");
    user
}

/// Device info for the default test client
pub fn device() -> DeviceInfo {
    device_with("fp-test-1", "203.0.113.10")
}

/// Device info with explicit fingerprint and address
pub fn device_with(fingerprint: &str, ip: &str) -> DeviceInfo {
    DeviceInfo {
        fingerprint: Some(fingerprint.to_string()),
        ip_address: Some(ip.to_string()),
        user_agent: Some("integration-tests/1.0".to_string()),
    }
}

/// Current TOTP code for an enrollment secret, matching the service's RFC
/// 6238 parameters (SHA-1, 6 digits, 30-second step)
pub fn totp_code(secret_b32: &str, email: &str) -> String {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        Secret::Encoded(secret_b32.to_string())
            .to_bytes()
            .expect("enrollment secret should be valid base32"),
        Some("Vantage Test".to_string()),
        email.to_string(),
    )
    .expect("TOTP construction");
    totp.generate_current().expect("system clock")
}

// ============================================================================
// Storage failure injection
// ============================================================================

/// Session store that delegates to a [`MemoryStore`] but can be armed to
/// fail revocations with a transient error, for exercising the paths that
/// must stay correct across a storage outage
#[derive(Clone)]
pub struct FlakySessionStore {
    inner: MemoryStore,
    revoke_failures: Arc<AtomicUsize>,
}

impl FlakySessionStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            revoke_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `n` calls to `revoke_session` fail
    pub fn fail_next_revocations(&self, n: usize) {
        self.revoke_failures.store(n, Ordering::SeqCst);
    }
}

impl SessionStore for FlakySessionStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.create_session(session).await
    }

    async fn find_session_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        self.inner.find_session_by_id(id).await
    }

    async fn find_active_session_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.inner.find_active_session_by_hash(token_hash).await
    }

    async fn find_session_by_replaced_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.inner.find_session_by_replaced_hash(token_hash).await
    }

    async fn find_active_sessions_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Session>, StoreError> {
        self.inner.find_active_sessions_for_user(user_id).await
    }

    async fn is_session_active(
        &self,
        session_id: Uuid,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        self.inner.is_session_active(session_id, token_hash).await
    }

    async fn rotate_session(
        &self,
        session_id: Uuid,
        presented_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner
            .rotate_session(session_id, presented_hash, new_hash, new_expires_at)
            .await
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        if self
            .revoke_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        self.inner.revoke_session(session_id).await
    }

    async fn revoke_all_sessions_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.inner.revoke_all_sessions_for_user(user_id).await
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.sweep_expired_sessions(now).await
    }
}

/// A service whose session store can be armed to fail, plus handles to the
/// shared backing store and the wrapper itself
pub struct FlakyAuth {
    pub service: AuthService<MemoryStore, FlakySessionStore, MemoryStore, RecordingMailer>,
    pub store: MemoryStore,
    pub sessions: FlakySessionStore,
}

/// Build a service over a [`FlakySessionStore`] with the stock test
/// configuration
pub fn setup_with_flaky_sessions() -> FlakyAuth {
    init_test_tracing();

    let store = MemoryStore::new();
    let sessions = FlakySessionStore::new(store.clone());
    let service = AuthService::new(
        Config::default_for_test(),
        store.clone(),
        sessions.clone(),
        store.clone(),
        RecordingMailer::new(),
    )
    .expect("service should build from test config");
    FlakyAuth {
        service,
        store,
        sessions,
    }
}
