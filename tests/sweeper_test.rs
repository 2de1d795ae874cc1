//! Expired-session sweeping integration tests.
//!
//! The sweep is idempotent housekeeping: expired sessions drop out of the
//! store, live ones are untouched, and the background task keeps doing it
//! on its own.
//!
//! Run with: `cargo test --test sweeper_test`

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helpers::{device, seed_user, setup, TestAuth, PASSWORD};
use vantage_auth::service::{AuthService, LoginOutcome, LoginRequest};
use vantage_auth::store::SessionStore;
use vantage_auth::token::hash_token;

async fn login_refresh_token(auth: &TestAuth, email: &str) -> String {
    let outcome = auth
        .service
        .login(
            LoginRequest {
                email: email.to_string(),
                password: PASSWORD.to_string(),
                remember_me: false,
            },
            &device(),
        )
        .await
        .expect("login should succeed");
    match outcome {
        LoginOutcome::Success(success) => success.refresh_token,
        LoginOutcome::MfaRequired(_) => panic!("unexpected MFA challenge"),
    }
}

/// Backdate a session so it reads as expired
async fn expire_session(auth: &TestAuth, refresh_token: &str) {
    let hash = hash_token(refresh_token);
    let session = auth
        .store
        .find_active_session_by_hash(&hash)
        .await
        .expect("lookup")
        .expect("session exists");
    let rotated = auth
        .store
        .rotate_session(
            session.id,
            &hash,
            &hash_token("backdated"),
            Utc::now() - chrono::Duration::seconds(1),
        )
        .await
        .expect("rotate");
    assert!(rotated);
}

#[tokio::test]
async fn test_sweep_removes_only_expired_sessions() {
    let auth = setup();
    let user = seed_user(&auth, "agent@example.com").await;
    seed_user(&auth, "broker@example.com").await;

    let stale = login_refresh_token(&auth, "agent@example.com").await;
    login_refresh_token(&auth, "broker@example.com").await;
    expire_session(&auth, &stale).await;

    let swept = auth
        .service
        .sweep_expired_sessions()
        .await
        .expect("sweep should succeed");
    assert_eq!(swept, 1);

    // The live session survived; the expired one is gone
    assert_eq!(auth.store.session_count(), 1);
    let remaining = auth
        .store
        .find_active_sessions_for_user(user.id)
        .await
        .expect("session query");
    assert!(remaining.is_empty(), "the expired session belonged to agent@");

    // Nothing left to do: the sweep is idempotent
    let swept_again = auth
        .service
        .sweep_expired_sessions()
        .await
        .expect("sweep should succeed");
    assert_eq!(swept_again, 0);
}

#[tokio::test]
async fn test_background_sweeper_runs_on_its_interval() {
    let auth = setup();
    seed_user(&auth, "agent@example.com").await;
    let stale = login_refresh_token(&auth, "agent@example.com").await;
    expire_session(&auth, &stale).await;

    let service = Arc::new(auth.service);
    let handle = AuthService::spawn_session_sweeper(
        Arc::clone(&service),
        Duration::from_millis(50),
    );

    // First tick fires immediately; give it a couple of periods of slack
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(auth.store.session_count(), 0, "sweeper should have run");

    handle.abort();
}
