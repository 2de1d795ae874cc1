//! Password hashing
//!
//! Argon2id via the PHC string format. Hash parameters ride along inside the
//! stored string, so parameter upgrades only affect newly hashed passwords.
//!
//! These functions are CPU-bound by design; async callers must wrap them in
//! `spawn_blocking` (the service layer does).

use std::sync::LazyLock;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

use crate::error::{AuthError, AuthResult};

/// Pre-computed hash used to equalize timing when no real hash exists for an
/// account (unknown email, or passwordless account). Verifying against it
/// costs the same as a real comparison.
static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| {
    hash_password("timing-equalization-placeholder")
        .expect("hashing a fixed password with valid parameters cannot fail")
});

/// Hash a password with Argon2id and a fresh random salt
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash string.
///
/// Returns `Ok(false)` on mismatch; `Err` only for malformed hashes or
/// backend failures.
pub fn verify_password(password: &str, hash: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AuthError::Internal(format!("stored password hash is malformed: {e}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::Internal(format!(
            "password verification failed: {e}"
        ))),
    }
}

/// Burn the same CPU a real verification would, then discard the result.
///
/// Called on the unknown-email path so response timing does not reveal
/// whether an account exists.
pub fn dummy_verify(password: &str) {
    let _ = verify_password(password, &DUMMY_HASH);
}
