//! Rate limiting configuration
//!
//! Limits are expressed as `requests,window_secs` pairs in the environment,
//! e.g. `RATE_LIMIT_AUTH=10,60` for ten requests per minute.

use serde::{Deserialize, Serialize};

use super::types::RateLimitScope;

/// One fixed-window limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum requests per window
    pub requests: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

/// Per-tier limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    pub global: LimitConfig,
    pub auth: LimitConfig,
    pub sensitive: LimitConfig,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            global: LimitConfig {
                requests: 300,
                window_secs: 60,
            },
            auth: LimitConfig {
                requests: 10,
                window_secs: 60,
            },
            sensitive: LimitConfig {
                requests: 5,
                window_secs: 300,
            },
        }
    }
}

/// Full limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch; when false every check passes
    pub enabled: bool,
    pub limits: RateLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: RateLimits::default(),
        }
    }
}

impl RateLimitConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset or unparseable
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = RateLimits::default();
        Self {
            enabled: std::env::var("RATE_LIMIT_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(true),
            limits: RateLimits {
                global: parse_limit_env("RATE_LIMIT_GLOBAL", defaults.global),
                auth: parse_limit_env("RATE_LIMIT_AUTH", defaults.auth),
                sensitive: parse_limit_env("RATE_LIMIT_SENSITIVE", defaults.sensitive),
            },
        }
    }

    /// Limit applied to a scope
    #[must_use]
    pub const fn limit_for(&self, scope: RateLimitScope) -> LimitConfig {
        match scope {
            RateLimitScope::Global => self.limits.global,
            RateLimitScope::Auth => self.limits.auth,
            RateLimitScope::Sensitive => self.limits.sensitive,
        }
    }
}

fn parse_limit_env(var: &str, default: LimitConfig) -> LimitConfig {
    std::env::var(var)
        .ok()
        .and_then(|v| parse_limit_config(&v))
        .unwrap_or(default)
}

/// Parse a `requests,window_secs` pair. Zero in either position is invalid.
fn parse_limit_config(value: &str) -> Option<LimitConfig> {
    let (requests, window) = value.split_once(',')?;
    let requests: u32 = requests.trim().parse().ok()?;
    let window_secs: u64 = window.trim().parse().ok()?;
    if requests == 0 || window_secs == 0 {
        return None;
    }
    Some(LimitConfig {
        requests,
        window_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_limit_config() {
        let limit = parse_limit_config("100,60").expect("parse");
        assert_eq!(limit.requests, 100);
        assert_eq!(limit.window_secs, 60);

        let spaced = parse_limit_config(" 5 , 300 ").expect("parse");
        assert_eq!(spaced.requests, 5);
        assert_eq!(spaced.window_secs, 300);
    }

    #[test]
    fn test_parse_limit_config_rejects_garbage() {
        assert!(parse_limit_config("").is_none());
        assert!(parse_limit_config("100").is_none());
        assert!(parse_limit_config("abc,60").is_none());
        assert!(parse_limit_config("0,60").is_none());
        assert!(parse_limit_config("100,0").is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("RATE_LIMIT_AUTH", "3,30");
        std::env::set_var("RATE_LIMIT_ENABLED", "true");

        let config = RateLimitConfig::from_env();
        assert!(config.enabled);
        assert_eq!(config.limits.auth.requests, 3);
        assert_eq!(config.limits.auth.window_secs, 30);
        // Unset vars keep defaults
        assert_eq!(config.limits.global.requests, 300);

        std::env::remove_var("RATE_LIMIT_AUTH");
        std::env::remove_var("RATE_LIMIT_ENABLED");
    }

    #[test]
    #[serial]
    fn test_from_env_bad_value_falls_back() {
        std::env::set_var("RATE_LIMIT_SENSITIVE", "not-a-limit");
        let config = RateLimitConfig::from_env();
        assert_eq!(config.limits.sensitive.requests, 5);
        std::env::remove_var("RATE_LIMIT_SENSITIVE");
    }

    #[test]
    fn test_limit_for_scope() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit_for(RateLimitScope::Auth).requests, 10);
        assert_eq!(config.limit_for(RateLimitScope::Sensitive).window_secs, 300);
    }
}
