//! Rate limiting
//!
//! Fixed-window limits applied before any credential work happens, so
//! brute-force traffic is shed without paying for password hashing.

pub mod config;
pub mod limiter;
pub mod types;

pub use config::{LimitConfig, RateLimitConfig, RateLimits};
pub use limiter::RateLimiter;
pub use types::{RateLimitDecision, RateLimitScope};
