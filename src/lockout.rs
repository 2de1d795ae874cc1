//! Account lockout policy
//!
//! Pure decisions over the lockout fields of a [`User`] record; persistence
//! stays with the caller. The invariant maintained here: `locked_until` is
//! only set once `failed_login_attempts` reaches the threshold, and the two
//! are always cleared together.
//!
//! Lock expiry is lazy. Nothing unlocks an account in the background; the
//! next login attempt after `locked_until` clears the lock before the
//! credential check runs.

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::user::User;

/// Current lock state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { until: DateTime<Utc> },
}

/// Threshold and duration rules for failed-login lockout
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    threshold: i32,
    base_duration_secs: i64,
    backoff_enabled: bool,
    backoff_cap_secs: i64,
}

impl LockoutPolicy {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.lockout_threshold,
            base_duration_secs: config.lockout_duration_secs,
            backoff_enabled: config.lockout_backoff_enabled,
            backoff_cap_secs: config.lockout_backoff_cap_secs,
        }
    }

    /// Lock state at `now`. An elapsed `locked_until` reads as unlocked even
    /// before the stale fields are cleared.
    #[must_use]
    pub fn state(&self, user: &User, now: DateTime<Utc>) -> LockState {
        match user.locked_until {
            Some(until) if until > now => LockState::Locked { until },
            _ => LockState::Unlocked,
        }
    }

    /// Clear a lock whose duration has elapsed.
    ///
    /// Returns true when the record changed and needs persisting. The
    /// attempt counter resets with the lock so the user gets a full set of
    /// fresh attempts.
    pub fn clear_expired(&self, user: &mut User, now: DateTime<Utc>) -> bool {
        match user.locked_until {
            Some(until) if until <= now => {
                user.locked_until = None;
                user.failed_login_attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// Register one failed credential check.
    ///
    /// Returns the lock expiry when this failure crossed the threshold.
    pub fn register_failure(&self, user: &mut User, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        user.failed_login_attempts += 1;
        if user.failed_login_attempts < self.threshold {
            return None;
        }

        let until = now + self.lock_duration(user.lockout_strikes);
        user.locked_until = Some(until);
        user.lockout_strikes += 1;
        Some(until)
    }

    /// Full reset on successful authentication or admin unlock: counter,
    /// lock, and backoff strikes all go back to zero
    pub fn reset(&self, user: &mut User) -> bool {
        let dirty = user.failed_login_attempts != 0
            || user.locked_until.is_some()
            || user.lockout_strikes != 0;
        user.failed_login_attempts = 0;
        user.locked_until = None;
        user.lockout_strikes = 0;
        dirty
    }

    /// Duration of the `strikes`-th consecutive lock
    fn lock_duration(&self, strikes: i32) -> Duration {
        if !self.backoff_enabled {
            return Duration::seconds(self.base_duration_secs);
        }
        // Shift capped to keep the multiplication in range
        let exp = strikes.clamp(0, 30) as u32;
        let secs = self
            .base_duration_secs
            .saturating_mul(1_i64 << exp)
            .min(self.backoff_cap_secs);
        Duration::seconds(secs)
    }
}
