//! Password reset, password change and email verification
//!
//! Reset requests always return the same generic response so the endpoint
//! cannot be used to enumerate accounts. Raw tokens exist only in the email
//! on their way out; the store only ever sees their SHA-256 hashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AuthError, AuthResult};
use crate::events::SecurityEventKind;
use crate::ratelimit::RateLimitScope;
use crate::store::{DeviceInfo, Mailer, SecurityEventStore, SessionStore, UserStore};
use crate::token::hash_token;
use crate::user::normalize_email;

use super::{generate_one_time_token, read_with_retry, AuthService};

/// What every reset request is told, account or no account
const RESET_RESPONSE_MESSAGE: &str =
    "If an account exists for that address, a password reset email has been sent.";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ForgotPasswordRequest {
    #[validate(email)]
    pub email: String,
}

/// Deliberately identical for known and unknown addresses. The expiry is
/// derived from configuration alone, so it leaks nothing about the account.
#[derive(Debug, Clone, Serialize)]
pub struct PasswordResetRequested {
    pub message: String,
    pub reset_token_expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 8, max = 128))]
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1))]
    pub current_password: String,
    #[validate(length(min = 8, max = 128))]
    pub new_password: String,
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
    /// Start a password reset. The response never reveals whether the
    /// address has an account.
    #[tracing::instrument(skip(self, req, device), fields(email = %req.email))]
    pub async fn request_password_reset(
        &self,
        req: ForgotPasswordRequest,
        device: &DeviceInfo,
    ) -> AuthResult<PasswordResetRequested> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        let email = normalize_email(&req.email);
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, Some(&email))?;

        let expires_at =
            Utc::now() + chrono::Duration::seconds(self.config.password_reset_ttl_secs);
        let generic = PasswordResetRequested {
            message: RESET_RESPONSE_MESSAGE.to_string(),
            reset_token_expires: expires_at,
        };

        let found = read_with_retry!(self, self.users.find_user_by_email(&email))?;
        let Some(mut user) = found else {
            tracing::debug!("password reset requested for unknown address");
            return Ok(generic);
        };
        if !user.is_active {
            return Ok(generic);
        }

        let token = generate_one_time_token();
        user.password_reset_token_hash = Some(hash_token(&token));
        user.password_reset_expires_at = Some(expires_at);
        self.store_call(self.users.update_user(&user)).await?;

        // If the email cannot go out the token is unreachable; withdraw it
        // rather than leave a live credential nobody holds
        if let Err(e) = self.mailer.send_password_reset(&user.email, &token).await {
            tracing::warn!(user_id = %user.id, error = %e, "password reset email failed");
            user.password_reset_token_hash = None;
            user.password_reset_expires_at = None;
            if let Err(e) = self.store_call(self.users.update_user(&user)).await {
                tracing::warn!(user_id = %user.id, error = %e, "failed to withdraw reset token");
            }
            return Ok(generic);
        }

        self.emit(
            SecurityEventKind::PasswordReset,
            Some(user.id),
            json!({ "phase": "requested" }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, "password reset email sent");
        Ok(generic)
    }

    /// Complete a password reset with the emailed token.
    ///
    /// Unknown and expired tokens get the same error. Success revokes every
    /// session and clears any lockout, since the owner just proved control
    /// of the mailbox.
    #[tracing::instrument(skip_all)]
    pub async fn confirm_password_reset(
        &self,
        req: ResetPasswordRequest,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let token_hash = hash_token(&req.token);
        let found = read_with_retry!(self, self.users.find_user_by_reset_token_hash(&token_hash))?;
        let Some(mut user) = found else {
            return Err(AuthError::TokenInvalid);
        };

        let now = Utc::now();
        let live = user.password_reset_expires_at.is_some_and(|at| at > now);
        if !live {
            user.password_reset_token_hash = None;
            user.password_reset_expires_at = None;
            if let Err(e) = self.store_call(self.users.update_user(&user)).await {
                tracing::warn!(user_id = %user.id, error = %e, "failed to clear stale reset token");
            }
            return Err(AuthError::TokenInvalid);
        }

        user.password_hash = Some(self.hash_password_blocking(req.new_password).await?);
        user.password_reset_token_hash = None;
        user.password_reset_expires_at = None;
        self.lockout.reset(&mut user);
        self.store_call(self.users.update_user(&user)).await?;

        let revoked = self
            .store_call(self.sessions.revoke_all_sessions_for_user(user.id))
            .await?;

        self.emit(
            SecurityEventKind::PasswordChanged,
            Some(user.id),
            json!({ "via": "reset", "sessions_revoked": revoked }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, sessions_revoked = revoked, "password reset completed");
        Ok(())
    }

    /// Change the password of a logged-in account. Requires the current
    /// password and ends every session, including the caller's.
    #[tracing::instrument(skip(self, req, device), fields(user_id = %user_id))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        req: ChangePasswordRequest,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let mut user = self.require_user(user_id).await?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        let Some(hash) = user.password_hash.clone() else {
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify_password_blocking(req.current_password, hash).await? {
            self.emit(
                SecurityEventKind::LoginFailed,
                Some(user.id),
                json!({ "operation": "change_password" }),
                device,
            )
            .await;
            return Err(AuthError::InvalidCredentials);
        }

        user.password_hash = Some(self.hash_password_blocking(req.new_password).await?);
        self.store_call(self.users.update_user(&user)).await?;

        let revoked = self
            .store_call(self.sessions.revoke_all_sessions_for_user(user.id))
            .await?;

        self.emit(
            SecurityEventKind::PasswordChanged,
            Some(user.id),
            json!({ "via": "change", "sessions_revoked": revoked }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, sessions_revoked = revoked, "password changed");
        Ok(())
    }

    /// Send (or resend) the email-verification link. A no-op for accounts
    /// that are already verified.
    #[tracing::instrument(skip(self, device), fields(user_id = %user_id))]
    pub async fn request_email_verification(
        &self,
        user_id: Uuid,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let mut user = self.require_user(user_id).await?;
        if user.is_verified {
            return Ok(());
        }

        let token = generate_one_time_token();
        user.email_verification_token_hash = Some(hash_token(&token));
        user.email_verification_expires_at =
            Some(Utc::now() + chrono::Duration::seconds(self.config.email_verification_ttl_secs));
        self.store_call(self.users.update_user(&user)).await?;

        if let Err(e) = self.mailer.send_email_verification(&user.email, &token).await {
            tracing::warn!(user_id = %user.id, error = %e, "verification email failed");
            user.email_verification_token_hash = None;
            user.email_verification_expires_at = None;
            if let Err(e) = self.store_call(self.users.update_user(&user)).await {
                tracing::warn!(user_id = %user.id, error = %e, "failed to withdraw verification token");
            }
        }
        Ok(())
    }

    /// Mark the account verified from an emailed token
    #[tracing::instrument(skip_all)]
    pub async fn confirm_email_verification(
        &self,
        token: &str,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let token_hash = hash_token(token);
        let found =
            read_with_retry!(self, self.users.find_user_by_verification_token_hash(&token_hash))?;
        let Some(mut user) = found else {
            return Err(AuthError::TokenInvalid);
        };

        let now = Utc::now();
        let live = user.email_verification_expires_at.is_some_and(|at| at > now);
        if !live {
            return Err(AuthError::TokenInvalid);
        }

        user.is_verified = true;
        user.email_verification_token_hash = None;
        user.email_verification_expires_at = None;
        self.store_call(self.users.update_user(&user)).await?;

        tracing::info!(user_id = %user.id, "email verified");
        Ok(())
    }
}
