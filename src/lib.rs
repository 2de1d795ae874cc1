//! Vantage Auth
//!
//! Authentication and session-management core for the Vantage platform.
//! Credential verification, JWT issuance and rotation, TOTP-based MFA,
//! account lockout, rate limiting and a security-event audit trail, all
//! behind storage traits so the engine stays independent of any backend.

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod lockout;
pub mod mfa;
pub mod password;
pub mod ratelimit;
pub mod service;
pub mod store;
pub mod token;
pub mod user;
