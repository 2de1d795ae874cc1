//! Storage ports
//!
//! The core talks to persistence through three narrow traits so it can sit
//! on Postgres, Redis, or anything else an embedder brings. The in-memory
//! reference implementation in [`memory`] backs the test suite and doubles
//! as executable documentation of the expected semantics.
//!
//! Contract notes that implementations must honor:
//! - `find_active_session_by_hash` only returns sessions that are both
//!   active and unexpired.
//! - `rotate_session` is a compare-and-swap on the stored hash and must be
//!   atomic per session; concurrent rotations of one session produce exactly
//!   one winner.
//! - `append_event` is append-only; events are never updated or deleted.

pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::SecurityEvent;
use crate::user::User;

pub use memory::{MailKind, MemoryStore, RecordingMailer, SentMail};

// ============================================================================
// Errors
// ============================================================================

/// Failures surfaced by storage adapters.
///
/// All variants collapse to `TRANSIENT_STORAGE_ERROR` at the API boundary;
/// the distinction only matters for logging and retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation exceeded the configured deadline
    #[error("store operation timed out")]
    Timeout,

    /// A targeted update found no matching record
    #[error("record not found")]
    NotFound,

    /// Insert collided with an existing record
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether a retry of the same call could plausibly succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Failure to hand a message to the mail transport
#[derive(Debug, thiserror::Error)]
#[error("mail delivery failed: {0}")]
pub struct MailerError(pub String);

// ============================================================================
// Session model
// ============================================================================

/// Client context attached to logins and audit events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Client-computed stable device identifier
    pub fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One refresh lineage: created at login, rotated on every refresh,
/// deactivated by logout, revocation, or expiry.
///
/// `token_hash` always holds the digest of the newest refresh token in the
/// lineage; `replaced_hash` remembers the immediately superseded one so a
/// replayed predecessor can be traced back here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 hex digest of the current refresh token
    pub token_hash: String,
    /// Digest of the refresh token this lineage most recently rotated away from
    pub replaced_hash: Option<String>,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl Session {
    /// New active session for a freshly issued refresh token.
    ///
    /// `id` is the refresh token's `jti`, so the initial token correlates
    /// 1:1 with its row by construction.
    #[must_use]
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
        device: &DeviceInfo,
    ) -> Self {
        Self {
            id,
            user_id,
            token_hash,
            replaced_hash: None,
            device_fingerprint: device.fingerprint.clone(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            is_active: true,
            expires_at,
            created_at: Utc::now(),
            rotated_at: None,
        }
    }

    /// Active and unexpired at `now`
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

// ============================================================================
// Ports
// ============================================================================

/// User record persistence
pub trait UserStore: Send + Sync {
    /// Look up by id
    fn find_user_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    /// Look up by normalized (lowercase) email
    fn find_user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    /// Look up by password reset token digest; expiry is the caller's check
    fn find_user_by_reset_token_hash(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    /// Look up by email verification token digest
    fn find_user_by_verification_token_hash(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    /// Insert a new record; fails on duplicate id or email
    fn insert_user(&self, user: &User) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write back a full record; `NotFound` when the id does not exist
    fn update_user(&self, user: &User) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Session persistence and the rotation CAS
pub trait SessionStore: Send + Sync {
    /// Persist a new session. At most one active session per
    /// (user, device fingerprint): an existing active session for the same
    /// fingerprint is deactivated first.
    fn create_session(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_session_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// Find the active, unexpired session holding this token digest
    fn find_active_session_by_hash(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// Find the session that most recently rotated away from this digest,
    /// active or not. Used to trace a replayed token back to its lineage.
    fn find_session_by_replaced_hash(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// All active, unexpired sessions for a user
    fn find_active_sessions_for_user(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Session>, StoreError>> + Send;

    /// Whether `session_id` is live and currently holds `token_hash`
    fn is_session_active(
        &self,
        session_id: Uuid,
        token_hash: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Compare-and-swap rotation: iff the session is live and still holds
    /// `presented_hash`, replace it with `new_hash` and extend the expiry.
    /// Returns false when the CAS loses (stale hash, revoked, expired).
    fn rotate_session(
        &self,
        session_id: Uuid,
        presented_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deactivate one session; returns whether it was active
    fn revoke_session(
        &self,
        session_id: Uuid,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deactivate every active session for a user; returns how many
    fn revoke_all_sessions_for_user(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Drop sessions whose expiry has passed; returns how many
    fn sweep_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Append-only audit trail persistence
pub trait SecurityEventStore: Send + Sync {
    fn append_event(
        &self,
        event: &SecurityEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Events for one user since `since`, oldest first
    fn recent_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<SecurityEvent>, StoreError>> + Send;
}

/// Outbound mail for reset and verification tokens.
///
/// Raw tokens pass through here and nowhere else; stores only ever see
/// digests.
pub trait Mailer: Send + Sync {
    fn send_password_reset(
        &self,
        email: &str,
        token: &str,
    ) -> impl Future<Output = Result<(), MailerError>> + Send;

    fn send_email_verification(
        &self,
        email: &str,
        token: &str,
    ) -> impl Future<Output = Result<(), MailerError>> + Send;
}

/// Mailer that logs instead of sending; the default for environments
/// without an outbound transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMailer;

impl Mailer for TracingMailer {
    async fn send_password_reset(&self, email: &str, _token: &str) -> Result<(), MailerError> {
        tracing::info!(email = %email, "password reset mail suppressed (tracing mailer)");
        Ok(())
    }

    async fn send_email_verification(&self, email: &str, _token: &str) -> Result<(), MailerError> {
        tracing::info!(email = %email, "verification mail suppressed (tracing mailer)");
        Ok(())
    }
}
