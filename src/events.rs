//! Security event audit trail
//!
//! Append-only records of every security-relevant branch. Recording is
//! best-effort by contract: an audit write failure is logged and swallowed,
//! never surfaced to the user whose login just succeeded.
//!
//! Risk scores are deterministic: base weight per kind, plus bounded
//! adjustments from the account's recent history. No randomness, no
//! external model, so the same inputs always score the same.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{DeviceInfo, SecurityEventStore};

/// How far back history counts toward a risk score
const RISK_WINDOW_MINUTES: i64 = 15;
/// Per-event bump for recent failures, and its total cap
const RECENT_FAILURE_WEIGHT: u8 = 5;
const RECENT_FAILURE_CAP: u8 = 25;
/// Bump for a device fingerprint never seen on this account
const NEW_DEVICE_WEIGHT: u8 = 15;
/// Bump when the source IP differs from the account's last event
const IP_CHANGE_WEIGHT: u8 = 10;

// ============================================================================
// Event kinds
// ============================================================================

/// Everything the audit trail knows how to describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    LoginSuccess,
    LoginFailed,
    /// Login attempt rejected because the account was locked
    LoginBlocked,
    MfaSetup,
    MfaSuccess,
    MfaFailed,
    PasswordReset,
    PasswordChanged,
    AccountLocked,
    AccountUnlocked,
    SuspiciousActivity,
    TokenRefresh,
    Logout,
    PermissionDenied,
}

impl SecurityEventKind {
    /// Stable string form, matching the serde representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::LoginBlocked => "LOGIN_BLOCKED",
            Self::MfaSetup => "MFA_SETUP",
            Self::MfaSuccess => "MFA_SUCCESS",
            Self::MfaFailed => "MFA_FAILED",
            Self::PasswordReset => "PASSWORD_RESET",
            Self::PasswordChanged => "PASSWORD_CHANGED",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountUnlocked => "ACCOUNT_UNLOCKED",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::Logout => "LOGOUT",
            Self::PermissionDenied => "PERMISSION_DENIED",
        }
    }

    /// Base risk weight before history adjustments
    #[must_use]
    pub const fn base_weight(&self) -> u8 {
        match self {
            Self::Logout => 0,
            Self::LoginSuccess | Self::MfaSuccess | Self::TokenRefresh => 5,
            Self::MfaSetup | Self::AccountUnlocked => 10,
            Self::PasswordReset => 15,
            Self::PasswordChanged | Self::PermissionDenied => 20,
            Self::LoginFailed => 25,
            Self::MfaFailed => 30,
            Self::LoginBlocked => 40,
            Self::AccountLocked => 60,
            Self::SuspiciousActivity => 75,
        }
    }

    /// Kinds that count as failures when scoring subsequent events
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::LoginFailed | Self::LoginBlocked | Self::MfaFailed | Self::PermissionDenied
        )
    }
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event record
// ============================================================================

/// One immutable audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    /// Absent when the event could not be tied to an account
    /// (e.g. a failed login against an unknown email)
    pub user_id: Option<Uuid>,
    pub kind: SecurityEventKind,
    /// Kind-specific structured context
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// 0-100, deterministic; see [`risk_score`]
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
}

/// Deterministic risk score for an event about to be recorded.
///
/// `recent` is the account's history inside the scoring window, newest
/// last. `new_device` means the fingerprint has never produced a session
/// for this account.
#[must_use]
pub fn risk_score(
    kind: SecurityEventKind,
    recent: &[SecurityEvent],
    ip_address: Option<&str>,
    new_device: bool,
) -> u8 {
    let mut score = u16::from(kind.base_weight());

    let failures = recent.iter().filter(|e| e.kind.is_failure()).count();
    let failure_bump =
        (failures as u16 * u16::from(RECENT_FAILURE_WEIGHT)).min(u16::from(RECENT_FAILURE_CAP));
    score += failure_bump;

    if new_device {
        score += u16::from(NEW_DEVICE_WEIGHT);
    }

    if let (Some(ip), Some(last)) = (ip_address, recent.last()) {
        if let Some(last_ip) = &last.ip_address {
            if last_ip != ip {
                score += u16::from(IP_CHANGE_WEIGHT);
            }
        }
    }

    score.min(100) as u8
}

// ============================================================================
// Recorder
// ============================================================================

/// Writes events through a [`SecurityEventStore`], absorbing failures
#[derive(Debug, Clone)]
pub struct SecurityEventRecorder<E> {
    store: Arc<E>,
}

impl<E: SecurityEventStore> SecurityEventRecorder<E> {
    pub const fn new(store: Arc<E>) -> Self {
        Self { store }
    }

    /// Record one event.
    ///
    /// Fetches recent history for scoring when the event has a subject;
    /// both the history read and the append are best-effort.
    pub async fn record(
        &self,
        kind: SecurityEventKind,
        user_id: Option<Uuid>,
        details: serde_json::Value,
        device: &DeviceInfo,
        new_device: bool,
    ) {
        let now = Utc::now();
        let recent = match user_id {
            Some(id) => {
                let since = now - Duration::minutes(RISK_WINDOW_MINUTES);
                match self.store.recent_for_user(id, since).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = %e, "risk history unavailable, scoring from base weight");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let event = SecurityEvent {
            id: Uuid::now_v7(),
            user_id,
            kind,
            details,
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            risk_score: risk_score(kind, &recent, device.ip_address.as_deref(), new_device),
            created_at: now,
        };

        tracing::debug!(
            kind = %event.kind,
            user_id = ?event.user_id,
            risk_score = event.risk_score,
            "security event"
        );

        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(kind = %kind, error = %e, "failed to append security event");
        }
    }
}
