//! Authentication service
//!
//! [`AuthService`] wires every subsystem together and owns the orchestration
//! flows: login, MFA, refresh and logout, password reset, and the admin
//! surface. It is generic over the storage ports so embedders bring their
//! own persistence; the crate's [`MemoryStore`](crate::store::MemoryStore)
//! is the reference implementation.
//!
//! Storage discipline, applied uniformly:
//! - every store call runs under the configured timeout
//! - reads are retried once after a short backoff on transient failure
//! - mutations are never retried; the caller sees `TransientStorage` and
//!   decides, so a slow write cannot be applied twice

mod admin;
mod login;
mod refresh;
mod reset;

pub use admin::*;
pub use login::*;
pub use refresh::*;
pub use reset::*;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AuthError, AuthResult};
use crate::events::{SecurityEventKind, SecurityEventRecorder};
use crate::keys::KeyRing;
use crate::lockout::LockoutPolicy;
use crate::mfa::MfaManager;
use crate::password;
use crate::ratelimit::{RateLimiter, RateLimitScope};
use crate::store::{
    DeviceInfo, Mailer, SecurityEventStore, SessionStore, StoreError, UserStore,
};
use crate::token::{Claims, TokenError, TokenIssuer, TokenType, TokenValidator};

/// Pause before the single read retry
pub(crate) const READ_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Retry a store read once on transient failure.
///
/// Takes the call expression itself so the future can be rebuilt for the
/// second attempt.
macro_rules! read_with_retry {
    ($svc:expr, $call:expr) => {{
        match $svc.store_call($call).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "store read failed, retrying once");
                tokio::time::sleep($crate::service::READ_RETRY_BACKOFF).await;
                $svc.store_call($call).await
            }
            other => other,
        }
    }};
}
pub(crate) use read_with_retry;

// ============================================================================
// Service
// ============================================================================

/// The authentication core, generic over user, session, and event stores
/// plus the outbound mailer
pub struct AuthService<U, S, E, M> {
    pub(crate) users: Arc<U>,
    pub(crate) sessions: Arc<S>,
    pub(crate) mailer: Arc<M>,
    pub(crate) recorder: SecurityEventRecorder<E>,
    pub(crate) issuer: TokenIssuer,
    pub(crate) validator: TokenValidator,
    pub(crate) mfa: MfaManager,
    pub(crate) lockout: LockoutPolicy,
    pub(crate) limiter: RateLimiter,
    pub(crate) config: Config,
}

impl<U, S, E, M> AuthService<U, S, E, M>
where
    U: UserStore,
    S: SessionStore,
    E: SecurityEventStore,
    M: Mailer,
{
    /// Assemble the service from validated configuration and storage ports.
    ///
    /// Fails only on unusable key material, which `Config::from_env` has
    /// normally already rejected.
    pub fn new(config: Config, users: U, sessions: S, events: E, mailer: M) -> AuthResult<Self> {
        let ring = Arc::new(
            KeyRing::from_config(&config)
                .map_err(|e| AuthError::Internal(format!("key ring: {e}")))?,
        );
        let mfa = MfaManager::new(&config)
            .map_err(|e| AuthError::Internal(format!("mfa manager: {e}")))?;

        Ok(Self {
            issuer: TokenIssuer::new(Arc::clone(&ring), &config),
            validator: TokenValidator::new(ring),
            mfa,
            lockout: LockoutPolicy::from_config(&config),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            users: Arc::new(users),
            sessions: Arc::new(sessions),
            recorder: SecurityEventRecorder::new(Arc::new(events)),
            mailer: Arc::new(mailer),
            config,
        })
    }

    /// The configuration the service was built with
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Access token validation
    // ========================================================================

    /// Validate an access token and return its claims.
    ///
    /// Purely local: signature, expiry, and type are checked against the key
    /// ring; no store is consulted. An algorithm-confusion attempt lands in
    /// the audit trail.
    pub async fn validate_access_token(
        &self,
        token: &str,
        device: &DeviceInfo,
    ) -> AuthResult<Claims> {
        match self.validator.validate(token, TokenType::Access) {
            Ok(claims) => Ok(claims),
            Err(e) => {
                self.flag_algorithm_confusion(&e, device).await;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop expired sessions from the store; returns how many went
    pub async fn sweep_expired_sessions(&self) -> AuthResult<u64> {
        let swept = self
            .store_call(self.sessions.sweep_expired_sessions(Utc::now()))
            .await?;
        if swept > 0 {
            tracing::info!(swept, "swept expired sessions");
        }
        self.limiter.purge_expired();
        Ok(swept)
    }

    /// Spawn a background task that sweeps expired sessions and stale rate
    /// limit windows every `period`. Aborts with its handle.
    pub fn spawn_session_sweeper(
        service: Arc<Self>,
        period: std::time::Duration,
    ) -> JoinHandle<()>
    where
        U: 'static,
        S: 'static,
        E: 'static,
        M: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep_expired_sessions().await {
                    tracing::warn!(error = %e, "session sweep failed");
                }
            }
        })
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    /// Run one store operation under the configured deadline
    pub(crate) async fn store_call<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.store_timeout(), op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Reject the request if any applicable rate limit window is exhausted
    pub(crate) fn enforce_rate_limit(
        &self,
        scope: RateLimitScope,
        device: &DeviceInfo,
        account: Option<&str>,
    ) -> AuthResult<()> {
        let ip = device.ip_address.as_deref().unwrap_or("unknown");

        let global = self.limiter.check(RateLimitScope::Global, ip, None);
        if !global.allowed {
            return Err(AuthError::RateLimited {
                retry_after: global.retry_after,
            });
        }

        let scoped = self.limiter.check(scope, ip, account);
        if !scoped.allowed {
            return Err(AuthError::RateLimited {
                retry_after: scoped.retry_after,
            });
        }
        Ok(())
    }

    /// Record an audit event; failures never propagate
    pub(crate) async fn emit(
        &self,
        kind: SecurityEventKind,
        user_id: Option<Uuid>,
        details: serde_json::Value,
        device: &DeviceInfo,
    ) {
        self.recorder.record(kind, user_id, details, device, false).await;
    }

    /// Record an audit event with an explicit new-device flag
    pub(crate) async fn emit_with_device_flag(
        &self,
        kind: SecurityEventKind,
        user_id: Option<Uuid>,
        details: serde_json::Value,
        device: &DeviceInfo,
        new_device: bool,
    ) {
        self.recorder
            .record(kind, user_id, details, device, new_device)
            .await;
    }

    /// Audit an algorithm-confusion attempt; other token errors pass silently
    pub(crate) async fn flag_algorithm_confusion(&self, err: &TokenError, device: &DeviceInfo) {
        if matches!(err, TokenError::AlgorithmMismatch) {
            self.emit(
                SecurityEventKind::SuspiciousActivity,
                None,
                serde_json::json!({ "reason": "token_algorithm_mismatch" }),
                device,
            )
            .await;
        }
    }

    /// Argon2 verification on the blocking pool
    pub(crate) async fn verify_password_blocking(
        &self,
        password: String,
        hash: String,
    ) -> AuthResult<bool> {
        tokio::task::spawn_blocking(move || password::verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))?
    }

    /// Argon2 hashing on the blocking pool
    pub(crate) async fn hash_password_blocking(&self, password: String) -> AuthResult<String> {
        tokio::task::spawn_blocking(move || password::hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
    }

    /// Timing-equalization hash burn for accounts that do not exist
    pub(crate) async fn dummy_verify_blocking(&self, password: String) {
        let _ = tokio::task::spawn_blocking(move || password::dummy_verify(&password)).await;
    }
}

/// Generate a URL-safe random token for reset and verification mails.
/// 32 bytes of OS randomness, base64url without padding.
#[must_use]
pub(crate) fn generate_one_time_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
