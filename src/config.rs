//! Configuration
//!
//! Everything is loaded from the environment in one pass at startup.
//! Secret material is validated eagerly: a missing or weak signing secret or
//! a malformed MFA encryption key aborts process start instead of surfacing
//! later as a runtime failure.

use anyhow::{bail, Context};
use std::env;
use std::time::Duration;

use crate::keys::MIN_SECRET_BYTES;
use crate::ratelimit::RateLimitConfig;

/// Required length of the MFA encryption key after hex decoding (AES-256)
pub const MFA_KEY_BYTES: usize = 32;

/// Runtime configuration for the authentication core
#[derive(Debug, Clone)]
pub struct Config {
    // Signing keys
    /// Current HMAC signing secret (min 32 bytes)
    pub jwt_secret: String,
    /// Key id stamped into the `kid` header of issued tokens
    pub jwt_key_id: String,
    /// Previous signing secret, accepted for verification during rotation
    pub jwt_previous_secret: Option<String>,
    /// Key id of the previous secret
    pub jwt_previous_key_id: String,
    /// How long the previous key stays valid after startup, in seconds
    pub jwt_rotation_grace_secs: i64,

    // Token lifetimes
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    /// Refresh TTL when the client asked to be remembered
    pub remember_me_ttl_secs: i64,
    /// Lifetime of the intermediate token between password and MFA steps
    pub mfa_token_ttl_secs: i64,

    // MFA
    /// Hex-encoded AES-256 key for TOTP secrets at rest (64 hex chars)
    pub mfa_encryption_key: String,
    /// Issuer shown in authenticator apps
    pub mfa_issuer: String,

    // Lockout
    /// Consecutive failures before the account locks
    pub lockout_threshold: i32,
    /// Base lock duration in seconds
    pub lockout_duration_secs: i64,
    /// Double the lock duration on each consecutive lock event
    pub lockout_backoff_enabled: bool,
    /// Ceiling for the backed-off duration in seconds
    pub lockout_backoff_cap_secs: i64,

    // One-time tokens
    pub password_reset_ttl_secs: i64,
    pub email_verification_ttl_secs: i64,

    // Storage discipline
    /// Budget for any single store call, in milliseconds
    pub store_timeout_ms: u64,

    pub rate_limits: RateLimitConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Fails fast on absent or weak secret material; every other knob has a
    /// sensible default.
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < MIN_SECRET_BYTES {
            bail!(
                "JWT_SECRET must be at least {MIN_SECRET_BYTES} bytes, got {}",
                jwt_secret.len()
            );
        }

        let jwt_previous_secret = env::var("JWT_PREVIOUS_SECRET").ok();
        if let Some(prev) = &jwt_previous_secret {
            if prev.len() < MIN_SECRET_BYTES {
                bail!(
                    "JWT_PREVIOUS_SECRET must be at least {MIN_SECRET_BYTES} bytes, got {}",
                    prev.len()
                );
            }
        }

        let mfa_encryption_key =
            env::var("MFA_ENCRYPTION_KEY").context("MFA_ENCRYPTION_KEY must be set")?;
        let decoded = hex::decode(&mfa_encryption_key)
            .context("MFA_ENCRYPTION_KEY must be hex-encoded")?;
        if decoded.len() != MFA_KEY_BYTES {
            bail!(
                "MFA_ENCRYPTION_KEY must decode to {MFA_KEY_BYTES} bytes, got {}",
                decoded.len()
            );
        }

        Ok(Self {
            jwt_secret,
            jwt_key_id: env::var("JWT_KEY_ID").unwrap_or_else(|_| "v1".to_string()),
            jwt_previous_secret,
            jwt_previous_key_id: env::var("JWT_PREVIOUS_KEY_ID")
                .unwrap_or_else(|_| "v0".to_string()),
            jwt_rotation_grace_secs: parse_env("JWT_ROTATION_GRACE", 86_400),
            access_token_ttl_secs: parse_env("JWT_ACCESS_EXPIRY", 900),
            refresh_token_ttl_secs: parse_env("JWT_REFRESH_EXPIRY", 604_800),
            remember_me_ttl_secs: parse_env("JWT_REMEMBER_ME_EXPIRY", 2_592_000),
            mfa_token_ttl_secs: parse_env("JWT_MFA_EXPIRY", 300),
            mfa_encryption_key,
            mfa_issuer: env::var("MFA_ISSUER").unwrap_or_else(|_| "Vantage".to_string()),
            lockout_threshold: parse_env("LOCKOUT_THRESHOLD", 5),
            lockout_duration_secs: parse_env("LOCKOUT_DURATION", 900),
            lockout_backoff_enabled: env::var("LOCKOUT_BACKOFF_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            lockout_backoff_cap_secs: parse_env("LOCKOUT_BACKOFF_CAP", 14_400),
            password_reset_ttl_secs: parse_env("PASSWORD_RESET_EXPIRY", 3_600),
            email_verification_ttl_secs: parse_env("EMAIL_VERIFICATION_EXPIRY", 86_400),
            store_timeout_ms: parse_env("STORE_TIMEOUT_MS", 5_000),
            rate_limits: RateLimitConfig::from_env(),
        })
    }

    /// Fixed configuration for tests: deterministic secrets, default knobs,
    /// limits high enough not to trip unless a test lowers them
    #[must_use]
    pub fn default_for_test() -> Self {
        let mut rate_limits = RateLimitConfig::default();
        rate_limits.limits.global.requests = 10_000;
        rate_limits.limits.auth.requests = 10_000;
        rate_limits.limits.sensitive.requests = 10_000;

        Self {
            jwt_secret: "test-jwt-secret-0123456789abcdef0123456789".to_string(),
            jwt_key_id: "v1".to_string(),
            jwt_previous_secret: None,
            jwt_previous_key_id: "v0".to_string(),
            jwt_rotation_grace_secs: 86_400,
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 604_800,
            remember_me_ttl_secs: 2_592_000,
            mfa_token_ttl_secs: 300,
            mfa_encryption_key:
                "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string(),
            mfa_issuer: "Vantage Test".to_string(),
            lockout_threshold: 5,
            lockout_duration_secs: 900,
            lockout_backoff_enabled: false,
            lockout_backoff_cap_secs: 14_400,
            password_reset_ttl_secs: 3_600,
            email_verification_ttl_secs: 86_400,
            store_timeout_ms: 5_000,
            rate_limits,
        }
    }

    /// Per-call budget for storage operations
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
