//! Authentication error types
//!
//! Every fallible operation in this crate resolves to [`AuthError`]. Each
//! variant carries a stable machine-readable code (see [`AuthError::code`])
//! that transport adapters can map onto their own status vocabulary.
//!
//! Credential failures are deliberately coarse: a wrong password and an
//! unknown email both surface as [`AuthError::InvalidCredentials`] so the
//! error channel cannot be used to enumerate accounts.

use crate::store::StoreError;

/// Errors that can occur during authentication operations
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Email or password did not match (also returned for unknown accounts)
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// Account exists but has been deactivated
    #[error("Account is disabled")]
    AccountDisabled,

    /// Account is temporarily locked after repeated failures
    #[error("Account is temporarily locked")]
    AccountLocked {
        /// Seconds until the lock expires
        retry_after: i64,
    },

    /// Credentials were correct but a second factor must be presented
    #[error("Multi-factor authentication required")]
    MfaRequired,

    /// TOTP or backup code was rejected
    #[error("Invalid multi-factor authentication code")]
    MfaInvalid,

    /// Token signature was valid but the token is past its expiry
    #[error("Token has expired")]
    TokenExpired,

    /// Token is malformed, has a bad signature, or was signed by an unknown key
    #[error("Invalid token")]
    TokenInvalid,

    /// Token is well-formed but of the wrong type for this operation
    #[error("Wrong token type for this operation")]
    TokenTypeMismatch,

    /// Refresh token refers to a session that is no longer active
    #[error("Session has been revoked")]
    SessionRevoked,

    /// Request was rejected by the rate limiter
    #[error("Too many requests")]
    RateLimited {
        /// Seconds until the current window resets
        retry_after: u64,
    },

    /// Request failed structural validation; the message may name fields
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Storage backend was unreachable or timed out; safe to retry
    #[error("Temporary storage failure, please retry")]
    TransientStorage,

    /// Unexpected internal failure (crypto, task join, key material)
    #[error("Internal error")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code for this error.
    ///
    /// These strings are part of the public contract and must not change
    /// between releases; clients branch on them.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountDisabled => "ACCOUNT_DISABLED",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::MfaInvalid => "MFA_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenTypeMismatch => "TOKEN_TYPE_MISMATCH",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::TransientStorage => "TRANSIENT_STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same request unchanged could succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage | Self::RateLimited { .. } | Self::AccountLocked { .. }
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        tracing::warn!(error = %err, "storage failure surfaced to caller");
        Self::TransientStorage
    }
}

/// Convenience alias used throughout the crate
pub type AuthResult<T> = Result<T, AuthError>;
