//! Login and MFA flows
//!
//! The login pipeline runs its stages in a fixed order: rate limit, account
//! load, lockout, credentials, MFA, then token issuance and session
//! persistence. Nothing earlier in the pipeline may be skipped by a later
//! stage, and the rate limiter runs before any password hashing so floods
//! never reach Argon2.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AuthError, AuthResult};
use crate::events::SecurityEventKind;
use crate::lockout::LockState;
use crate::mfa::{looks_like_totp, BackupCodeOutcome, MfaEnrollment, MfaManager};
use crate::ratelimit::RateLimitScope;
use crate::store::{DeviceInfo, Mailer, SecurityEventStore, Session, SessionStore, UserStore};
use crate::token::{hash_token, TokenType};
use crate::user::{normalize_email, PublicUser, User};

use super::{read_with_retry, AuthService};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// Successful authentication: tokens plus the user's public profile
#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub user: PublicUser,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

/// Password accepted, second factor outstanding
#[derive(Debug, Clone, Serialize)]
pub struct MfaChallenge {
    /// Always true; present so clients can branch on the response shape
    pub mfa_required: bool,
    /// Short-lived token that must accompany the MFA verification
    pub mfa_token: String,
}

/// Outcome of a login attempt that got past the credential check
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LoginOutcome {
    Success(Box<LoginSuccess>),
    MfaRequired(MfaChallenge),
}

/// Whether an MFA code verifies an enrollment or completes a login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaVerifyKind {
    Setup,
    Login,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MfaVerifyRequest {
    pub user_id: Uuid,
    #[validate(length(min = 1))]
    pub code: String,
    #[serde(rename = "type")]
    pub kind: MfaVerifyKind,
    /// Required when `kind` is `login`
    pub mfa_token: Option<String>,
}

/// Outcome of an MFA verification
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MfaVerifyOutcome {
    /// Login-kind verification succeeded; the session is established
    LoggedIn(Box<LoginSuccess>),
    /// Setup-kind verification succeeded; MFA is now enabled
    SetupConfirmed { mfa_enabled: bool },
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MfaDisableRequest {
    #[validate(length(min = 1))]
    pub password: String,
    #[validate(length(min = 1))]
    pub code: String,
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
    /// Authenticate with email and password.
    ///
    /// Returns tokens directly, or an MFA challenge when the account has a
    /// second factor enrolled. Unknown accounts and wrong passwords are
    /// indistinguishable in both response and timing.
    #[tracing::instrument(skip(self, req, device), fields(email = %req.email))]
    pub async fn login(&self, req: LoginRequest, device: &DeviceInfo) -> AuthResult<LoginOutcome> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        let email = normalize_email(&req.email);

        // Stage 1: shed floods before any expensive work
        self.enforce_rate_limit(RateLimitScope::Auth, device, Some(&email))?;

        // Stage 2: account load
        let found = read_with_retry!(self, self.users.find_user_by_email(&email))?;
        let Some(mut user) = found else {
            // Burn a hash so the miss costs as much as a mismatch
            self.dummy_verify_blocking(req.password).await;
            self.emit(
                SecurityEventKind::LoginFailed,
                None,
                json!({ "reason": "unknown_account" }),
                device,
            )
            .await;
            return Err(AuthError::InvalidCredentials);
        };

        // Stage 3: lockout, with lazy unlock of elapsed locks
        let now = Utc::now();
        if self.lockout.clear_expired(&mut user, now) {
            self.store_call(self.users.update_user(&user)).await?;
            self.emit(
                SecurityEventKind::AccountUnlocked,
                Some(user.id),
                json!({ "by": "expiry" }),
                device,
            )
            .await;
        }
        if let LockState::Locked { until } = self.lockout.state(&user, now) {
            self.emit(
                SecurityEventKind::LoginBlocked,
                Some(user.id),
                json!({ "locked_until": until }),
                device,
            )
            .await;
            return Err(AuthError::AccountLocked {
                retry_after: (until - now).num_seconds().max(1),
            });
        }

        if !user.is_active {
            self.emit(
                SecurityEventKind::LoginFailed,
                Some(user.id),
                json!({ "reason": "account_disabled" }),
                device,
            )
            .await;
            return Err(AuthError::AccountDisabled);
        }

        // Stage 4: credential check
        let verified = match user.password_hash.clone() {
            Some(hash) => self.verify_password_blocking(req.password, hash).await?,
            None => {
                // Passwordless account: equalize timing, then fail
                self.dummy_verify_blocking(req.password).await;
                false
            }
        };
        if !verified {
            return Err(self.register_login_failure(&mut user, device).await);
        }

        // Stage 5: second factor
        if user.mfa_enabled {
            let mfa_token = self.issuer.issue_mfa_token(&user)?;
            tracing::debug!(user_id = %user.id, "password accepted, awaiting MFA");
            return Ok(LoginOutcome::MfaRequired(MfaChallenge {
                mfa_required: true,
                mfa_token,
            }));
        }

        // Stages 6-7: issue tokens and persist the session
        let success = self.establish_session(&mut user, req.remember_me, device).await?;
        Ok(LoginOutcome::Success(Box::new(success)))
    }

    /// Verify an MFA code, either to confirm an enrollment or to complete a
    /// challenged login
    #[tracing::instrument(skip(self, req, device), fields(user_id = %req.user_id, kind = ?req.kind))]
    pub async fn verify_mfa(
        &self,
        req: MfaVerifyRequest,
        device: &DeviceInfo,
    ) -> AuthResult<MfaVerifyOutcome> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        match req.kind {
            MfaVerifyKind::Setup => {
                self.confirm_mfa_enrollment(&req, device).await?;
                Ok(MfaVerifyOutcome::SetupConfirmed { mfa_enabled: true })
            }
            MfaVerifyKind::Login => {
                let success = self.complete_mfa_login(&req, device).await?;
                Ok(MfaVerifyOutcome::LoggedIn(Box::new(success)))
            }
        }
    }

    /// Start MFA enrollment: generate a secret and backup codes, park them
    /// as pending until a code proves the authenticator has the secret
    #[tracing::instrument(skip(self, device), fields(user_id = %user_id))]
    pub async fn begin_mfa_enrollment(
        &self,
        user_id: Uuid,
        device: &DeviceInfo,
    ) -> AuthResult<MfaEnrollment> {
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let mut user = self.require_user(user_id).await?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        if user.mfa_enabled {
            return Err(AuthError::Validation(
                "multi-factor authentication is already enabled".to_string(),
            ));
        }

        let (enrollment, pending) = self.mfa.begin_enrollment(&user.email)?;
        user.mfa_pending_secret = Some(pending.encrypted_secret);
        user.mfa_backup_codes = pending.backup_codes;
        self.store_call(self.users.update_user(&user)).await?;

        tracing::info!(user_id = %user.id, "MFA enrollment started");
        Ok(enrollment)
    }

    /// Disable MFA. Requires the current password and a valid code so a
    /// stolen session alone cannot strip the second factor.
    #[tracing::instrument(skip(self, req, device), fields(user_id = %user_id))]
    pub async fn disable_mfa(
        &self,
        user_id: Uuid,
        req: MfaDisableRequest,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let mut user = self.require_user(user_id).await?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        let Some(secret) = user.mfa_secret.clone() else {
            return Err(AuthError::Validation(
                "multi-factor authentication is not enabled".to_string(),
            ));
        };

        let Some(hash) = user.password_hash.clone() else {
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify_password_blocking(req.password, hash).await? {
            self.emit(
                SecurityEventKind::LoginFailed,
                Some(user.id),
                json!({ "operation": "disable_mfa" }),
                device,
            )
            .await;
            return Err(AuthError::InvalidCredentials);
        }

        if !self.check_second_factor(&mut user, &secret, &req.code, device).await? {
            return Err(AuthError::MfaInvalid);
        }

        user.mfa_enabled = false;
        user.mfa_secret = None;
        user.mfa_pending_secret = None;
        user.mfa_backup_codes.clear();
        self.store_call(self.users.update_user(&user)).await?;

        self.emit(
            SecurityEventKind::MfaSetup,
            Some(user.id),
            json!({ "phase": "disabled" }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, "MFA disabled");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Confirm a pending enrollment with a first valid code
    async fn confirm_mfa_enrollment(
        &self,
        req: &MfaVerifyRequest,
        device: &DeviceInfo,
    ) -> AuthResult<()> {
        self.enforce_rate_limit(RateLimitScope::Sensitive, device, None)?;

        let mut user = self.require_user(req.user_id).await?;
        let Some(pending) = user.mfa_pending_secret.clone() else {
            return Err(AuthError::MfaInvalid);
        };

        if !self.mfa.verify_code(&pending, &user.email, req.code.trim())? {
            self.emit(
                SecurityEventKind::MfaFailed,
                Some(user.id),
                json!({ "phase": "setup" }),
                device,
            )
            .await;
            return Err(AuthError::MfaInvalid);
        }

        user.mfa_secret = Some(pending);
        user.mfa_pending_secret = None;
        user.mfa_enabled = true;
        self.store_call(self.users.update_user(&user)).await?;

        self.emit(
            SecurityEventKind::MfaSetup,
            Some(user.id),
            json!({ "phase": "enabled" }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, "MFA enabled");
        Ok(())
    }

    /// Second half of a challenged login
    async fn complete_mfa_login(
        &self,
        req: &MfaVerifyRequest,
        device: &DeviceInfo,
    ) -> AuthResult<LoginSuccess> {
        self.enforce_rate_limit(RateLimitScope::Auth, device, Some(&req.user_id.to_string()))?;

        let Some(mfa_token) = req.mfa_token.as_deref() else {
            return Err(AuthError::Validation(
                "mfa_token is required to complete a login".to_string(),
            ));
        };
        let claims = match self.validator.validate(mfa_token, TokenType::Mfa) {
            Ok(claims) => claims,
            Err(e) => {
                self.flag_algorithm_confusion(&e, device).await;
                return Err(e.into());
            }
        };
        if claims.sub != req.user_id.to_string() {
            return Err(AuthError::TokenInvalid);
        }

        let mut user = self.require_user(req.user_id).await?;
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        // The account may have been locked between the password step and now
        let now = Utc::now();
        if let LockState::Locked { until } = self.lockout.state(&user, now) {
            self.emit(
                SecurityEventKind::LoginBlocked,
                Some(user.id),
                json!({ "locked_until": until, "stage": "mfa" }),
                device,
            )
            .await;
            return Err(AuthError::AccountLocked {
                retry_after: (until - now).num_seconds().max(1),
            });
        }

        let Some(secret) = user.mfa_secret.clone() else {
            return Err(AuthError::MfaInvalid);
        };
        if !user.mfa_enabled {
            return Err(AuthError::MfaInvalid);
        }

        if !self.check_second_factor(&mut user, &secret, &req.code, device).await? {
            return Err(AuthError::MfaInvalid);
        }

        self.emit(
            SecurityEventKind::MfaSuccess,
            Some(user.id),
            json!({ "remaining_backup_codes": user.remaining_backup_codes() }),
            device,
        )
        .await;

        self.establish_session(&mut user, false, device).await
    }

    /// Check a TOTP or backup code against the user's enabled secret.
    ///
    /// Persists immediately when a backup code is consumed, so the code is
    /// burned even if a later step fails. Emits the failure events; the
    /// caller converts `false` into the public error.
    async fn check_second_factor(
        &self,
        user: &mut User,
        encrypted_secret: &str,
        code: &str,
        device: &DeviceInfo,
    ) -> AuthResult<bool> {
        let code = code.trim();
        if looks_like_totp(code) {
            if self.mfa.verify_code(encrypted_secret, &user.email, code)? {
                return Ok(true);
            }
            self.emit(
                SecurityEventKind::MfaFailed,
                Some(user.id),
                json!({ "method": "totp" }),
                device,
            )
            .await;
            return Ok(false);
        }

        match MfaManager::consume_backup_code(&mut user.mfa_backup_codes, code, Utc::now()) {
            BackupCodeOutcome::Accepted => {
                self.store_call(self.users.update_user(user)).await?;
                tracing::info!(
                    user_id = %user.id,
                    remaining = user.remaining_backup_codes(),
                    "backup code consumed"
                );
                Ok(true)
            }
            BackupCodeOutcome::AlreadyUsed => {
                self.emit(
                    SecurityEventKind::SuspiciousActivity,
                    Some(user.id),
                    json!({ "reason": "backup_code_reuse" }),
                    device,
                )
                .await;
                Ok(false)
            }
            BackupCodeOutcome::Unknown => {
                self.emit(
                    SecurityEventKind::MfaFailed,
                    Some(user.id),
                    json!({ "method": "backup_code" }),
                    device,
                )
                .await;
                Ok(false)
            }
        }
    }

    /// Count a failed credential check, locking the account at threshold.
    /// Returns the error the caller should surface for this attempt.
    async fn register_login_failure(&self, user: &mut User, device: &DeviceInfo) -> AuthError {
        let now = Utc::now();
        let locked_until = self.lockout.register_failure(user, now);

        // Mutation: not retried. If it fails the attempt still reads as a
        // credential failure, just without the persisted counter.
        if let Err(e) = self.store_call(self.users.update_user(user)).await {
            tracing::warn!(user_id = %user.id, error = %e, "failed to persist lockout counter");
        }

        self.emit(
            SecurityEventKind::LoginFailed,
            Some(user.id),
            json!({ "attempts": user.failed_login_attempts }),
            device,
        )
        .await;

        if let Some(until) = locked_until {
            self.emit(
                SecurityEventKind::AccountLocked,
                Some(user.id),
                json!({ "locked_until": until, "strikes": user.lockout_strikes }),
                device,
            )
            .await;
            tracing::warn!(
                user_id = %user.id,
                locked_until = %until,
                "account locked after repeated failures"
            );
        }

        AuthError::InvalidCredentials
    }

    /// Issue a token pair and persist its session; the final stage of every
    /// successful authentication path
    pub(crate) async fn establish_session(
        &self,
        user: &mut User,
        remember_me: bool,
        device: &DeviceInfo,
    ) -> AuthResult<LoginSuccess> {
        // Success clears lockout state and backoff strikes
        if self.lockout.reset(user) {
            self.store_call(self.users.update_user(user)).await?;
        }

        let pair = self.issuer.issue_pair(user, remember_me)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(pair.refresh_expires_in);
        let session = Session::new(
            pair.refresh_token_id,
            user.id,
            hash_token(&pair.refresh_token),
            expires_at,
            device,
        );

        // Best-effort risk input; a failed read just scores as a known device
        let new_device = match &device.fingerprint {
            Some(fp) => read_with_retry!(self, self.sessions.find_active_sessions_for_user(user.id))
                .map(|sessions| {
                    !sessions
                        .iter()
                        .any(|s| s.device_fingerprint.as_deref() == Some(fp.as_str()))
                })
                .unwrap_or(false),
            None => false,
        };

        self.store_call(self.sessions.create_session(&session)).await?;

        self.emit_with_device_flag(
            SecurityEventKind::LoginSuccess,
            Some(user.id),
            json!({ "session_id": session.id, "remember_me": remember_me }),
            device,
            new_device,
        )
        .await;
        tracing::info!(user_id = %user.id, session_id = %session.id, "user logged in");

        Ok(LoginSuccess {
            user: user.public(),
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: pair.access_expires_in,
        })
    }

    /// Load a user for an authenticated operation
    pub(crate) async fn require_user(&self, user_id: Uuid) -> AuthResult<User> {
        read_with_retry!(self, self.users.find_user_by_id(user_id))?
            .ok_or(AuthError::InvalidCredentials)
    }
}
