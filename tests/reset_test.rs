//! Password reset, password change and email verification tests.
//!
//! Covers the emailed-token flows end to end:
//! - reset requests are enumeration-safe and deliver a single-use token
//! - confirming a reset rekeys the account, clears lockout, and revokes
//!   every session
//! - password change requires the current password
//! - email verification round-trips through the mailer
//!
//! Run with: `cargo test --test reset_test`

mod helpers;

use chrono::{Duration, Utc};
use helpers::{device, seed_user, setup, TestAuth, PASSWORD};
use vantage_auth::error::AuthError;
use vantage_auth::events::SecurityEventKind;
use vantage_auth::service::{
    ChangePasswordRequest, ForgotPasswordRequest, LoginOutcome, LoginRequest, RefreshRequest,
    ResetPasswordRequest,
};
use vantage_auth::store::{MailKind, UserStore};

const EMAIL: &str = "agent@example.com";
const NEW_PASSWORD: &str = "entirely-new-passphrase-9";

fn forgot(email: &str) -> ForgotPasswordRequest {
    ForgotPasswordRequest {
        email: email.to_string(),
    }
}

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        remember_me: false,
    }
}

async fn request_and_capture_token(auth: &TestAuth) -> String {
    auth.service
        .request_password_reset(forgot(EMAIL), &device())
        .await
        .expect("reset request should succeed");
    auth.mailer
        .last_token(EMAIL, MailKind::PasswordReset)
        .expect("reset email should carry a token")
}

// ============================================================================
// Password reset
// ============================================================================

#[tokio::test]
async fn test_reset_flow_rekeys_the_account_and_revokes_sessions() {
    let auth = setup();
    seed_user(&auth, EMAIL).await;

    // Standing session that must die with the reset
    let outcome = auth
        .service
        .login(login_request(EMAIL, PASSWORD), &device())
        .await
        .expect("login should succeed");
    let LoginOutcome::Success(success) = outcome else {
        panic!("expected direct success");
    };

    let token = request_and_capture_token(&auth).await;
    auth.service
        .confirm_password_reset(
            ResetPasswordRequest {
                token,
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect("reset confirmation should succeed");

    // Old refresh token is dead
    let err = auth
        .service
        .refresh(
            RefreshRequest {
                refresh_token: success.refresh_token.clone(),
            },
            &device(),
        )
        .await
        .expect_err("sessions must not survive a reset");
    assert!(matches!(err, AuthError::SessionRevoked));

    // Old password out, new password in
    let err = auth
        .service
        .login(login_request(EMAIL, PASSWORD), &device())
        .await
        .expect_err("old password must be gone");
    assert!(matches!(err, AuthError::InvalidCredentials));
    auth.service
        .login(login_request(EMAIL, NEW_PASSWORD), &device())
        .await
        .expect("new password should authenticate");

    let changes = auth.store.events_of_kind(SecurityEventKind::PasswordChanged);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].details["via"], "reset");
    assert_eq!(changes[0].details["sessions_revoked"], 1);
}

#[tokio::test]
async fn test_reset_response_does_not_reveal_whether_the_account_exists() {
    let auth = setup();
    seed_user(&auth, EMAIL).await;

    let known = auth
        .service
        .request_password_reset(forgot(EMAIL), &device())
        .await
        .expect("known address");
    let unknown = auth
        .service
        .request_password_reset(forgot("ghost@example.com"), &device())
        .await
        .expect("unknown address");

    assert_eq!(known.message, unknown.message);
    assert!(!known.message.is_empty());
    // Both carry a policy-derived expiry, so its presence says nothing either
    assert!(known.reset_token_expires > Utc::now());
    assert!(unknown.reset_token_expires > Utc::now());

    // Only the real account got mail
    assert_eq!(auth.mailer.sent().len(), 1);
    assert!(auth.mailer.last_token("ghost@example.com", MailKind::PasswordReset).is_none());
}

#[tokio::test]
async fn test_reset_token_is_single_use() {
    let auth = setup();
    seed_user(&auth, EMAIL).await;
    let token = request_and_capture_token(&auth).await;

    auth.service
        .confirm_password_reset(
            ResetPasswordRequest {
                token: token.clone(),
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect("first confirmation should succeed");

    let err = auth
        .service
        .confirm_password_reset(
            ResetPasswordRequest {
                token,
                new_password: "yet-another-passphrase".to_string(),
            },
            &device(),
        )
        .await
        .expect_err("a spent token must be rejected");
    assert!(matches!(err, AuthError::TokenInvalid));
}

#[tokio::test]
async fn test_expired_reset_token_is_rejected() {
    let auth = setup();
    let user = seed_user(&auth, EMAIL).await;
    let token = request_and_capture_token(&auth).await;

    let mut stale = auth
        .store
        .find_user_by_id(user.id)
        .await
        .expect("lookup")
        .expect("user exists");
    stale.password_reset_expires_at = Some(Utc::now() - Duration::seconds(1));
    auth.store.update_user(&stale).await.expect("update");

    let err = auth
        .service
        .confirm_password_reset(
            ResetPasswordRequest {
                token,
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect_err("expired token must be rejected");
    assert!(matches!(err, AuthError::TokenInvalid));

    // The stale token is also cleared from the record
    let after = auth
        .store
        .find_user_by_id(user.id)
        .await
        .expect("lookup")
        .expect("user exists");
    assert!(after.password_reset_token_hash.is_none());
}

#[tokio::test]
async fn test_undeliverable_reset_mail_withdraws_the_token() {
    let auth = setup();
    let user = seed_user(&auth, EMAIL).await;
    auth.mailer.set_failing(true);

    auth.service
        .request_password_reset(forgot(EMAIL), &device())
        .await
        .expect("response stays generic even when mail fails");

    let after = auth
        .store
        .find_user_by_id(user.id)
        .await
        .expect("lookup")
        .expect("user exists");
    assert!(
        after.password_reset_token_hash.is_none(),
        "an unreachable token must not stay live"
    );
    assert!(auth.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_reset_rejects_a_weak_replacement_password() {
    let auth = setup();
    seed_user(&auth, EMAIL).await;
    let token = request_and_capture_token(&auth).await;

    let err = auth
        .service
        .confirm_password_reset(
            ResetPasswordRequest {
                token,
                new_password: "short".to_string(),
            },
            &device(),
        )
        .await
        .expect_err("a seven-character password is under the floor");
    assert!(matches!(err, AuthError::Validation(_)));
}

#[tokio::test]
async fn test_reset_clears_a_standing_lockout() {
    let auth = setup();
    seed_user(&auth, EMAIL).await;

    for _ in 0..5 {
        let _ = auth
            .service
            .login(login_request(EMAIL, "wrong"), &device())
            .await;
    }

    let token = request_and_capture_token(&auth).await;
    auth.service
        .confirm_password_reset(
            ResetPasswordRequest {
                token,
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect("reset should succeed for a locked account");

    // Proving mailbox control unlocks immediately
    auth.service
        .login(login_request(EMAIL, NEW_PASSWORD), &device())
        .await
        .expect("login should succeed straight after the reset");
}

// ============================================================================
// Password change
// ============================================================================

#[tokio::test]
async fn test_change_password_requires_the_current_password() {
    let auth = setup();
    let user = seed_user(&auth, EMAIL).await;

    let err = auth
        .service
        .change_password(
            user.id,
            ChangePasswordRequest {
                current_password: "wrong".to_string(),
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect_err("wrong current password");
    assert!(matches!(err, AuthError::InvalidCredentials));

    let failures = auth.store.events_of_kind(SecurityEventKind::LoginFailed);
    assert_eq!(failures[0].details["operation"], "change_password");
}

#[tokio::test]
async fn test_change_password_revokes_every_session() {
    let auth = setup();
    let user = seed_user(&auth, EMAIL).await;
    auth.service
        .login(login_request(EMAIL, PASSWORD), &device())
        .await
        .expect("login should succeed");

    auth.service
        .change_password(
            user.id,
            ChangePasswordRequest {
                current_password: PASSWORD.to_string(),
                new_password: NEW_PASSWORD.to_string(),
            },
            &device(),
        )
        .await
        .expect("change should succeed");

    let changes = auth.store.events_of_kind(SecurityEventKind::PasswordChanged);
    assert_eq!(changes[0].details["via"], "change");
    assert_eq!(changes[0].details["sessions_revoked"], 1);

    auth.service
        .login(login_request(EMAIL, NEW_PASSWORD), &device())
        .await
        .expect("new password should authenticate");
}

// ============================================================================
// Email verification
// ============================================================================

#[tokio::test]
async fn test_email_verification_round_trip() {
    let auth = setup();
    let user = seed_user(&auth, EMAIL).await;
    assert!(!user.is_verified);

    auth.service
        .request_email_verification(user.id, &device())
        .await
        .expect("verification request should succeed");
    let token = auth
        .mailer
        .last_token(EMAIL, MailKind::EmailVerification)
        .expect("verification email should carry a token");

    auth.service
        .confirm_email_verification(&token, &device())
        .await
        .expect("confirmation should succeed");

    let after = auth
        .store
        .find_user_by_id(user.id)
        .await
        .expect("lookup")
        .expect("user exists");
    assert!(after.is_verified);
    assert!(after.email_verification_token_hash.is_none());

    // Already verified: later requests send nothing
    auth.service
        .request_email_verification(user.id, &device())
        .await
        .expect("repeat request is a no-op");
    assert_eq!(auth.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_unknown_verification_token_is_rejected() {
    let auth = setup();
    let err = auth
        .service
        .confirm_email_verification("never-issued", &device())
        .await
        .expect_err("unknown token");
    assert!(matches!(err, AuthError::TokenInvalid));
}
