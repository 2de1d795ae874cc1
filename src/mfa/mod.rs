//! Multi-factor authentication
//!
//! TOTP (RFC 6238: SHA-1, 6 digits, 30-second step, ±1 step skew) plus
//! single-use backup codes. TOTP secrets are never persisted in the clear;
//! they are sealed with AES-256-GCM before they reach a store and decrypted
//! only for the duration of a check.
//!
//! Enrollment is two-phase: `begin_enrollment` parks an encrypted secret as
//! pending, and only a successful code verification promotes it to active.
//! This stops a user from locking themselves out by enabling MFA with an
//! authenticator that never actually received the secret.

pub mod crypto;

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::{AuthError, AuthResult};
use crate::token::hash_token;
use crate::user::BackupCode;

pub use crypto::CryptoError;

/// Number of backup codes handed out per enrollment
pub const BACKUP_CODE_COUNT: usize = 10;
/// Random bytes per backup code; rendered as twice as many hex characters
const BACKUP_CODE_LEN_BYTES: usize = 5;

/// Client-facing enrollment material, shown exactly once
#[derive(Debug, Clone, serde::Serialize)]
pub struct MfaEnrollment {
    /// Base32 secret for manual authenticator entry
    pub secret: String,
    /// otpauth:// URL for QR code rendering
    pub otpauth_url: String,
    /// Plaintext backup codes; only hashes are retained server-side
    pub backup_codes: Vec<String>,
}

/// Server-side residue of an enrollment, persisted on the user as pending
#[derive(Debug, Clone)]
pub struct PendingMfa {
    /// AES-GCM sealed TOTP secret
    pub encrypted_secret: String,
    /// Hashed backup codes
    pub backup_codes: Vec<BackupCode>,
}

/// What happened when a backup code was presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCodeOutcome {
    /// Code matched an unused entry; it is now marked consumed
    Accepted,
    /// Code matched an entry that was already consumed
    AlreadyUsed,
    /// Code matched nothing
    Unknown,
}

/// TOTP enrollment and verification against encrypted stored secrets
#[derive(Clone)]
pub struct MfaManager {
    encryption_key: Zeroizing<Vec<u8>>,
    issuer: String,
}

impl std::fmt::Debug for MfaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaManager")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl MfaManager {
    /// Build from configuration. The hex key was already validated at config
    /// load; this re-checks so the manager is safe to construct directly.
    pub fn new(config: &Config) -> Result<Self, CryptoError> {
        let key = hex::decode(&config.mfa_encryption_key)?;
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Ok(Self {
            encryption_key: Zeroizing::new(key),
            issuer: config.mfa_issuer.clone(),
        })
    }

    /// Generate a fresh secret and backup codes for `account_email`.
    ///
    /// Nothing is persisted here; the caller stores the [`PendingMfa`] half
    /// and shows the [`MfaEnrollment`] half to the user once.
    pub fn begin_enrollment(&self, account_email: &str) -> AuthResult<(MfaEnrollment, PendingMfa)> {
        // 20 random bytes, the RFC 6238 recommended secret size
        let secret = Secret::default();
        let secret_b32 = secret.to_encoded().to_string();

        let totp = self.build_totp(&secret_b32, account_email)?;
        let encrypted_secret = crypto::encrypt_secret(&secret_b32, &self.encryption_key)
            .map_err(|e| AuthError::Internal(format!("secret encryption failed: {e}")))?;

        let plain_codes = generate_backup_codes();
        let hashed = plain_codes
            .iter()
            .map(|code| BackupCode::new(hash_token(code)))
            .collect();

        Ok((
            MfaEnrollment {
                secret: secret_b32,
                otpauth_url: totp.get_url(),
                backup_codes: plain_codes,
            },
            PendingMfa {
                encrypted_secret,
                backup_codes: hashed,
            },
        ))
    }

    /// Check a TOTP code against an encrypted stored secret.
    ///
    /// Accepts the current step and one step either side to absorb clock
    /// drift between server and authenticator.
    pub fn verify_code(
        &self,
        encrypted_secret: &str,
        account_email: &str,
        code: &str,
    ) -> AuthResult<bool> {
        let secret_b32 = crypto::decrypt_secret(encrypted_secret, &self.encryption_key)
            .map_err(|e| AuthError::Internal(format!("secret decryption failed: {e}")))?;
        let totp = self.build_totp(&secret_b32, account_email)?;
        totp.check_current(code)
            .map_err(|e| AuthError::Internal(format!("system clock error: {e}")))
    }

    /// Try to consume a backup code, marking it used on success.
    ///
    /// A code that matches an already-consumed entry is reported separately
    /// so the caller can flag the reuse as suspicious.
    pub fn consume_backup_code(
        codes: &mut [BackupCode],
        presented: &str,
        now: DateTime<Utc>,
    ) -> BackupCodeOutcome {
        let digest = hash_token(presented.trim());
        for code in codes.iter_mut() {
            if code.code_hash == digest {
                if code.is_used() {
                    return BackupCodeOutcome::AlreadyUsed;
                }
                code.used_at = Some(now);
                return BackupCodeOutcome::Accepted;
            }
        }
        BackupCodeOutcome::Unknown
    }

    fn build_totp(&self, secret_b32: &str, account_email: &str) -> AuthResult<TOTP> {
        let secret_bytes = Secret::Encoded(secret_b32.to_string())
            .to_bytes()
            .map_err(|e| AuthError::Internal(format!("invalid TOTP secret: {e:?}")))?;
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some(self.issuer.clone()),
            account_email.to_string(),
        )
        .map_err(|e| AuthError::Internal(format!("TOTP construction failed: {e}")))
    }
}

/// Does this code look like a TOTP code (6 digits) rather than a backup code?
#[must_use]
pub fn looks_like_totp(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

/// Fresh set of random backup codes, 10 hex characters each
fn generate_backup_codes() -> Vec<String> {
    use rand::RngCore;

    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; BACKUP_CODE_LEN_BYTES];
            rng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MfaManager {
        MfaManager::new(&Config::default_for_test()).expect("manager")
    }

    #[test]
    fn test_enrollment_produces_usable_secret() {
        let (enrollment, pending) = manager().begin_enrollment("agent@example.com").expect("enroll");

        assert!(!enrollment.secret.is_empty());
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));
        assert!(enrollment.otpauth_url.contains("Vantage"));
        assert_eq!(enrollment.backup_codes.len(), BACKUP_CODE_COUNT);
        for code in &enrollment.backup_codes {
            assert_eq!(code.len(), 2 * BACKUP_CODE_LEN_BYTES);
            assert!(code.bytes().all(|b| b.is_ascii_hexdigit()));
        }

        // The sealed secret decrypts back to the displayed one
        let mgr = manager();
        let opened = crypto::decrypt_secret(&pending.encrypted_secret, &mgr.encryption_key)
            .expect("decrypt");
        assert_eq!(opened, enrollment.secret);
    }

    #[test]
    fn test_current_code_verifies() {
        let mgr = manager();
        let (enrollment, pending) = mgr.begin_enrollment("agent@example.com").expect("enroll");

        // Compute the current code the way an authenticator app would
        let totp = mgr
            .build_totp(&enrollment.secret, "agent@example.com")
            .expect("totp");
        let code = totp.generate_current().expect("code");

        assert!(mgr
            .verify_code(&pending.encrypted_secret, "agent@example.com", &code)
            .expect("verify"));
        assert!(!mgr
            .verify_code(&pending.encrypted_secret, "agent@example.com", "000000")
            .expect("verify")
            || code == "000000");
    }

    #[test]
    fn test_backup_codes_are_single_use() {
        let now = Utc::now();
        let (enrollment, pending) = manager().begin_enrollment("a@b.co").expect("enroll");
        let mut stored = pending.backup_codes;
        let code = enrollment.backup_codes[3].clone();

        assert_eq!(
            MfaManager::consume_backup_code(&mut stored, &code, now),
            BackupCodeOutcome::Accepted
        );
        assert_eq!(
            MfaManager::consume_backup_code(&mut stored, &code, now),
            BackupCodeOutcome::AlreadyUsed
        );
        assert_eq!(
            MfaManager::consume_backup_code(&mut stored, "ffffffffff", now),
            BackupCodeOutcome::Unknown
        );
    }

    #[test]
    fn test_backup_code_whitespace_tolerated() {
        let now = Utc::now();
        let (enrollment, pending) = manager().begin_enrollment("a@b.co").expect("enroll");
        let mut stored = pending.backup_codes;
        let padded = format!("  {}  ", enrollment.backup_codes[0]);

        assert_eq!(
            MfaManager::consume_backup_code(&mut stored, &padded, now),
            BackupCodeOutcome::Accepted
        );
    }

    #[test]
    fn test_looks_like_totp() {
        assert!(looks_like_totp("123456"));
        assert!(!looks_like_totp("12345"));
        assert!(!looks_like_totp("1234567"));
        assert!(!looks_like_totp("12345a"));
        // Backup codes are 10 hex chars, never mistaken for TOTP
        assert!(!looks_like_totp("a1b2c3d4e5"));
    }

    #[test]
    fn test_backup_codes_are_unique_per_enrollment() {
        let (enrollment, _) = manager().begin_enrollment("a@b.co").expect("enroll");
        let mut codes = enrollment.backup_codes.clone();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
    }
}
