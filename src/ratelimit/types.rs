//! Rate limiting types

use serde::{Deserialize, Serialize};

/// Which limit tier applies to a request.
///
/// Tiers are checked independently; a login attempt consumes from both the
/// global and the auth tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// All traffic from one client
    Global,
    /// Credential-bearing endpoints: login, MFA verify, refresh
    Auth,
    /// Password reset, email verification, MFA enrollment
    Sensitive,
}

impl RateLimitScope {
    /// Stable string used in counter keys and log fields
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Auth => "auth",
            Self::Sensitive => "sensitive",
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request should be allowed
    pub allowed: bool,
    /// Maximum requests allowed in the window
    pub limit: u32,
    /// Requests remaining in the current window
    pub remaining: u32,
    /// Unix timestamp when the window resets
    pub reset_at: i64,
    /// Seconds until the window resets; meaningful when denied
    pub retry_after: u64,
}

impl RateLimitDecision {
    /// An always-allow decision for disabled limiters
    #[must_use]
    pub const fn bypass(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: 0,
            retry_after: 0,
        }
    }
}
