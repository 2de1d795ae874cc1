//! Signing key management
//!
//! A [`KeyRing`] holds the current HMAC signing key plus any previous keys
//! still inside their rotation grace window. Tokens are always signed with
//! the current key; verification consults whichever ring member the token's
//! `kid` header names, provided that key is still valid at verification time.
//!
//! Key rotation is a construction-time event: build a new ring with the old
//! key demoted to a bounded validity window and swap it in.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use zeroize::Zeroizing;

use crate::config::Config;

/// Minimum accepted secret length in bytes. HS256 keys below this are
/// rejected at startup.
pub const MIN_SECRET_BYTES: usize = 32;

/// Errors raised while assembling a key ring
#[derive(Debug, thiserror::Error)]
pub enum KeyRingError {
    /// Secret material is shorter than [`MIN_SECRET_BYTES`]
    #[error("signing secret for key '{kid}' is {actual} bytes, minimum is {min}")]
    SecretTooShort {
        kid: String,
        actual: usize,
        min: usize,
    },

    /// Two ring members share a key id
    #[error("duplicate key id '{0}' in ring")]
    DuplicateKeyId(String),
}

// ============================================================================
// Signing key
// ============================================================================

/// One HMAC key with an identity and a validity window.
///
/// `valid_until = None` means the key never ages out (the usual state for
/// the current key).
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    secret: Zeroizing<Vec<u8>>,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Create a key valid from now with no expiry
    pub fn new(kid: impl Into<String>, secret: &[u8]) -> Result<Self, KeyRingError> {
        Self::with_window(kid, secret, Utc::now(), None)
    }

    /// Create a key with an explicit validity window
    pub fn with_window(
        kid: impl Into<String>,
        secret: &[u8],
        valid_from: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<Self, KeyRingError> {
        let kid = kid.into();
        if secret.len() < MIN_SECRET_BYTES {
            return Err(KeyRingError::SecretTooShort {
                kid,
                actual: secret.len(),
                min: MIN_SECRET_BYTES,
            });
        }
        Ok(Self {
            kid,
            secret: Zeroizing::new(secret.to_vec()),
            valid_from,
            valid_until,
        })
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Raw secret bytes, for constructing encoding/decoding keys
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Whether this key may verify signatures at `now`
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if now < self.valid_from {
            return false;
        }
        self.valid_until.is_none_or(|until| now <= until)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret bytes are never printed
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("secret", &"<redacted>")
            .field("valid_from", &self.valid_from)
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

// ============================================================================
// Key ring
// ============================================================================

/// The set of keys a token validator will accept, plus the single key the
/// issuer signs with.
#[derive(Debug, Clone)]
pub struct KeyRing {
    /// Index 0 is always the current signing key
    keys: Vec<SigningKey>,
}

impl KeyRing {
    /// Assemble a ring from the current key and zero or more previous keys.
    ///
    /// Previous keys should carry a bounded `valid_until`; the ring rejects
    /// duplicate key ids but deliberately does not police window overlap.
    pub fn new(current: SigningKey, previous: Vec<SigningKey>) -> Result<Self, KeyRingError> {
        let mut keys = Vec::with_capacity(previous.len() + 1);
        keys.push(current);
        keys.extend(previous);

        for (i, key) in keys.iter().enumerate() {
            if keys[..i].iter().any(|k| k.kid == key.kid) {
                return Err(KeyRingError::DuplicateKeyId(key.kid.clone()));
            }
        }
        Ok(Self { keys })
    }

    /// Build the ring described by the configuration.
    ///
    /// When a previous secret is configured it enters the ring valid until
    /// `now + rotation grace`, i.e. the grace period counts from process
    /// start.
    pub fn from_config(config: &Config) -> Result<Self, KeyRingError> {
        let current = SigningKey::new(&config.jwt_key_id, config.jwt_secret.as_bytes())?;

        let mut previous = Vec::new();
        if let Some(prev_secret) = &config.jwt_previous_secret {
            let until = Utc::now() + Duration::seconds(config.jwt_rotation_grace_secs);
            previous.push(SigningKey::with_window(
                &config.jwt_previous_key_id,
                prev_secret.as_bytes(),
                DateTime::<Utc>::MIN_UTC,
                Some(until),
            )?);
        }

        Self::new(current, previous)
    }

    /// The key new tokens are signed with
    #[must_use]
    pub fn current(&self) -> &SigningKey {
        // Ring construction guarantees at least one key
        &self.keys[0]
    }

    /// Look up a verification key by id, honoring its validity window
    #[must_use]
    pub fn verification_key(&self, kid: &str, now: DateTime<Utc>) -> Option<&SigningKey> {
        self.keys
            .iter()
            .find(|k| k.kid == kid && k.is_valid_at(now))
    }

    /// All keys usable for verification at `now`, current first
    pub fn verification_keys(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SigningKey> {
        self.keys.iter().filter(move |k| k.is_valid_at(now))
    }
}
