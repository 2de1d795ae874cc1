//! Fixed-window rate limiter
//!
//! In-process counters over a concurrent map. Each (scope, client) pair gets
//! its own window; the first request in a window starts it and the counter
//! resets when the window elapses. Checks are atomic per key via the map's
//! entry API.
//!
//! The limiter fails open by construction: it cannot reach any backend, so
//! there is nothing to fail closed on. Disabling it (`enabled = false`)
//! turns every check into a bypass.

use chrono::Utc;
use dashmap::DashMap;

use super::config::RateLimitConfig;
use super::types::{RateLimitDecision, RateLimitScope};

/// One client's counter inside the current window
#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: i64,
    count: u32,
}

/// In-process fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Check and consume one request for `(scope, ip[, account])`.
    ///
    /// The account discriminator stops one hammered account from exhausting
    /// the budget of every client behind a shared IP, and vice versa.
    #[tracing::instrument(skip(self), fields(scope = %scope))]
    pub fn check(
        &self,
        scope: RateLimitScope,
        ip: &str,
        account: Option<&str>,
    ) -> RateLimitDecision {
        let limit = self.config.limit_for(scope);
        if !self.config.enabled {
            return RateLimitDecision::bypass(limit.requests);
        }

        let key = Self::build_key(scope, ip, account);
        let now = Utc::now().timestamp();
        let window_secs = limit.window_secs as i64;

        let mut entry = self.windows.entry(key).or_insert(Window {
            started_at: now,
            count: 0,
        });

        // Window elapsed: start a fresh one
        if now >= entry.started_at + window_secs {
            entry.started_at = now;
            entry.count = 0;
        }

        entry.count += 1;
        let allowed = entry.count <= limit.requests;
        let reset_at = entry.started_at + window_secs;
        let decision = RateLimitDecision {
            allowed,
            limit: limit.requests,
            remaining: limit.requests.saturating_sub(entry.count),
            reset_at,
            retry_after: if allowed {
                0
            } else {
                u64::try_from(reset_at - now).unwrap_or(0)
            },
        };
        drop(entry);

        if !decision.allowed {
            tracing::warn!(
                scope = %scope,
                ip = %ip,
                retry_after = decision.retry_after,
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Drop windows that have fully elapsed. Called from the maintenance
    /// sweeper so idle clients do not accumulate forever.
    pub fn purge_expired(&self) {
        let now = Utc::now().timestamp();
        let max_window = [
            self.config.limits.global.window_secs,
            self.config.limits.auth.window_secs,
            self.config.limits.sensitive.window_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(0) as i64;

        let before = self.windows.len();
        self.windows
            .retain(|_, w| now < w.started_at + max_window);
        let purged = before - self.windows.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired rate limit windows");
        }
    }

    /// Current configuration
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn build_key(scope: RateLimitScope, ip: &str, account: Option<&str>) -> String {
        match account {
            Some(account) => format!("{}:{}:{}", scope.as_str(), ip, account),
            None => format!("{}:{}", scope.as_str(), ip),
        }
    }
}
