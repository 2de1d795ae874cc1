//! Refresh-token rotation and logout
//!
//! Every refresh token is single-use. Presenting one rotates the session to
//! a new token atomically; presenting one that has already been rotated is
//! treated as theft and kills the whole session, current token included.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AuthError, AuthResult};
use crate::events::SecurityEventKind;
use crate::ratelimit::RateLimitScope;
use crate::store::{DeviceInfo, Mailer, SecurityEventStore, SessionStore, UserStore};
use crate::token::{hash_token, TokenType};

use super::{read_with_retry, AuthService};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// A fresh token pair from a successful rotation
#[derive(Debug, Clone, Serialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

/// Logout accepts either credential; at least one must be present
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
    pub session_id: Option<Uuid>,
}

// ============================================================================
// Flows
// ============================================================================

impl<U, S, E, M> AuthService<U, S, E, M>
where
    U: UserStore,
    S: SessionStore,
    E: SecurityEventStore,
    M: Mailer,
{
    /// Exchange a refresh token for a new pair, rotating the session.
    ///
    /// The rotation is a compare-and-swap on the stored token hash, so two
    /// concurrent presentations of the same token produce exactly one winner;
    /// the loser is handled as a replay.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(
        &self,
        req: RefreshRequest,
        device: &DeviceInfo,
    ) -> AuthResult<RefreshedTokens> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        self.enforce_rate_limit(RateLimitScope::Auth, device, None)?;

        let claims = match self.validator.validate(&req.refresh_token, TokenType::Refresh) {
            Ok(claims) => claims,
            Err(e) => {
                self.flag_algorithm_confusion(&e, device).await;
                return Err(e.into());
            }
        };
        let user_id = claims.user_id()?;
        let presented_hash = hash_token(&req.refresh_token);

        let found =
            read_with_retry!(self, self.sessions.find_active_session_by_hash(&presented_hash))?;
        let Some(session) = found else {
            return self.handle_unmatched_refresh(&presented_hash, user_id, device).await;
        };

        if session.user_id != user_id {
            // A signed token whose subject disagrees with its session row
            self.emit(
                SecurityEventKind::SuspiciousActivity,
                Some(user_id),
                json!({ "reason": "refresh_subject_mismatch", "session_id": session.id }),
                device,
            )
            .await;
            return Err(AuthError::TokenInvalid);
        }

        let now = Utc::now();
        if !session.is_live(now) {
            return Err(AuthError::SessionRevoked);
        }

        // The account must still be present and active to keep the session
        let user = match read_with_retry!(self, self.users.find_user_by_id(user_id))? {
            Some(user) => user,
            None => {
                self.store_call(self.sessions.revoke_session(session.id)).await?;
                return Err(AuthError::TokenInvalid);
            }
        };
        if !user.is_active {
            self.store_call(self.sessions.revoke_session(session.id)).await?;
            self.emit(
                SecurityEventKind::Logout,
                Some(user.id),
                json!({ "session_id": session.id, "reason": "account_disabled" }),
                device,
            )
            .await;
            return Err(AuthError::AccountDisabled);
        }

        // Long-lived sessions keep their long window across rotations
        let remember_me = claims.exp - claims.iat > self.config.refresh_token_ttl_secs;
        let pair = self.issuer.issue_pair(&user, remember_me)?;
        let new_hash = hash_token(&pair.refresh_token);
        let new_expires_at = now + chrono::Duration::seconds(pair.refresh_expires_in);

        let rotated = self
            .store_call(self.sessions.rotate_session(
                session.id,
                &presented_hash,
                &new_hash,
                new_expires_at,
            ))
            .await?;
        if !rotated {
            // Lost the race: another presentation of this token already won
            self.store_call(self.sessions.revoke_session(session.id)).await?;
            self.emit(
                SecurityEventKind::SuspiciousActivity,
                Some(user.id),
                json!({ "reason": "refresh_rotation_race", "session_id": session.id }),
                device,
            )
            .await;
            return Err(AuthError::SessionRevoked);
        }

        self.emit(
            SecurityEventKind::TokenRefresh,
            Some(user.id),
            json!({ "session_id": session.id }),
            device,
        )
        .await;
        tracing::debug!(user_id = %user.id, session_id = %session.id, "session rotated");

        Ok(RefreshedTokens {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: pair.access_expires_in,
        })
    }

    /// End a session. Idempotent: revoking an already-dead session is not an
    /// error, so clients can always fire-and-forget their logout.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, req: LogoutRequest, device: &DeviceInfo) -> AuthResult<()> {
        let session = match (&req.refresh_token, req.session_id) {
            (Some(token), _) => {
                let hash = hash_token(token);
                read_with_retry!(self, self.sessions.find_active_session_by_hash(&hash))?
            }
            (None, Some(id)) => read_with_retry!(self, self.sessions.find_session_by_id(id))?,
            (None, None) => {
                return Err(AuthError::Validation(
                    "a refresh_token or session_id is required".to_string(),
                ));
            }
        };

        let Some(session) = session else {
            // Nothing matched; the session is already gone
            return Ok(());
        };

        let revoked = self.store_call(self.sessions.revoke_session(session.id)).await?;
        if revoked {
            self.emit(
                SecurityEventKind::Logout,
                Some(session.user_id),
                json!({ "session_id": session.id }),
                device,
            )
            .await;
            tracing::info!(session_id = %session.id, "session logged out");
        }
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// A validly-signed refresh token with no active session under its hash:
    /// either a replay of a rotated token, or use of a revoked session
    async fn handle_unmatched_refresh(
        &self,
        presented_hash: &str,
        user_id: Uuid,
        device: &DeviceInfo,
    ) -> AuthResult<RefreshedTokens> {
        let lineage =
            read_with_retry!(self, self.sessions.find_session_by_replaced_hash(presented_hash))?;

        if let Some(session) = lineage {
            // The token was already rotated away. Whoever holds the current
            // descendant may be the thief, so the whole session dies.
            // Revocation failures propagate; the retried request finds this
            // lineage again and re-runs the kill.
            self.emit(
                SecurityEventKind::SuspiciousActivity,
                Some(session.user_id),
                json!({ "reason": "refresh_token_replay", "session_id": session.id }),
                device,
            )
            .await;
            self.store_call(self.sessions.revoke_session(session.id)).await?;
            tracing::warn!(
                user_id = %session.user_id,
                session_id = %session.id,
                "refresh token replay detected, session revoked"
            );
        } else {
            self.emit(
                SecurityEventKind::SuspiciousActivity,
                Some(user_id),
                json!({ "reason": "refresh_after_revocation" }),
                device,
            )
            .await;
        }

        Err(AuthError::SessionRevoked)
    }
}
