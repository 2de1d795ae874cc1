//! Token issuance and validation
//!
//! Stateless HS256 JWTs with a pinned algorithm. Every token carries a `kid`
//! header naming the ring key that signed it, a random `jti`, and a `typ`
//! claim so access, refresh and MFA tokens can never stand in for each other.
//!
//! Validation never trusts the token's own `alg` header beyond checking it
//! against the pinned algorithm; an unexpected algorithm is rejected before
//! any key lookup happens.

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AuthError;
use crate::keys::KeyRing;
use crate::user::{Permissions, Role, User};

/// The only signature algorithm this crate will ever emit or accept
pub const PINNED_ALGORITHM: Algorithm = Algorithm::HS256;

// ============================================================================
// Claims
// ============================================================================

/// Discriminates what an otherwise well-formed token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived bearer credential
    Access,
    /// Long-lived rotation credential tied to a session
    Refresh,
    /// Intermediate credential issued between password and MFA verification
    Mfa,
}

/// JWT claims embedded in every issued token.
///
/// Role and permissions are snapshots taken at issuance; permission changes
/// only propagate when the client refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID as a string
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub permissions: Permissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<Uuid>,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
    /// Random per-token id
    pub jti: String,
    /// Token type
    pub typ: TokenType,
}

impl Claims {
    /// Parse `sub` back into a user id
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::TokenInvalid)
    }
}

/// Access + refresh token pair returned by login and refresh
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires
    pub access_expires_in: i64,
    /// Seconds until the refresh token expires
    pub refresh_expires_in: i64,
    /// `jti` of the refresh token, used as the session row id at creation
    pub refresh_token_id: Uuid,
}

/// Hash a token for at-rest storage (SHA-256, lowercase hex).
///
/// Session rows and reset/verification records never hold raw tokens; all
/// lookups compare digests.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ============================================================================
// Rejections
// ============================================================================

/// Why validation refused a token.
///
/// More granular than [`AuthError`] so the orchestrator can distinguish an
/// algorithm-confusion attempt (worth an audit event) from an ordinary
/// expiry before collapsing to the public taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("token type mismatch: expected {expected:?}, got {actual:?}")]
    WrongType {
        expected: TokenType,
        actual: TokenType,
    },

    /// Header `alg` differs from the pinned algorithm
    #[error("unexpected signature algorithm")]
    AlgorithmMismatch,

    #[error("signature did not verify under any valid key")]
    BadSignature,

    /// Header names a key id the ring does not currently accept
    #[error("unknown or retired key id")]
    UnknownKey,

    #[error("token is malformed")]
    Malformed,
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::TokenExpired,
            TokenError::WrongType { .. } => Self::TokenTypeMismatch,
            TokenError::AlgorithmMismatch
            | TokenError::BadSignature
            | TokenError::UnknownKey
            | TokenError::Malformed => Self::TokenInvalid,
        }
    }
}

// ============================================================================
// Issuer
// ============================================================================

/// Signs tokens with the ring's current key.
///
/// Holds no mutable state; TTLs come from configuration at construction.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    ring: Arc<KeyRing>,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    remember_me_ttl_secs: i64,
    mfa_ttl_secs: i64,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(ring: Arc<KeyRing>, config: &Config) -> Self {
        Self {
            ring,
            access_ttl_secs: config.access_token_ttl_secs,
            refresh_ttl_secs: config.refresh_token_ttl_secs,
            remember_me_ttl_secs: config.remember_me_ttl_secs,
            mfa_ttl_secs: config.mfa_token_ttl_secs,
        }
    }

    /// Issue an access + refresh pair for a fully authenticated user.
    ///
    /// `remember_me` stretches the refresh TTL; the access TTL is unaffected.
    pub fn issue_pair(&self, user: &User, remember_me: bool) -> Result<TokenPair, AuthError> {
        let refresh_ttl = if remember_me {
            self.remember_me_ttl_secs
        } else {
            self.refresh_ttl_secs
        };

        let refresh_id = Uuid::now_v7();
        let access_token = self.sign(user, TokenType::Access, self.access_ttl_secs, Uuid::now_v7())?;
        let refresh_token = self.sign(user, TokenType::Refresh, refresh_ttl, refresh_id)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_in: self.access_ttl_secs,
            refresh_expires_in: refresh_ttl,
            refresh_token_id: refresh_id,
        })
    }

    /// Issue the short-lived intermediate token handed out when a password
    /// checks out but MFA still stands between the user and a session
    pub fn issue_mfa_token(&self, user: &User) -> Result<String, AuthError> {
        self.sign(user, TokenType::Mfa, self.mfa_ttl_secs, Uuid::now_v7())
    }

    fn sign(
        &self,
        user: &User,
        typ: TokenType,
        ttl_secs: i64,
        jti: Uuid,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            role: user.role,
            permissions: user.permissions,
            agency_id: user.agency_id,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
            jti: jti.to_string(),
            typ,
        };

        let key = self.ring.current();
        let mut header = Header::new(PINNED_ALGORITHM);
        header.kid = Some(key.kid().to_string());

        encode(&header, &claims, &EncodingKey::from_secret(key.secret()))
            .map_err(|e| AuthError::Internal(format!("token signing failed: {e}")))
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Verifies tokens against the ring, honoring key validity windows
#[derive(Debug, Clone)]
pub struct TokenValidator {
    ring: Arc<KeyRing>,
}

impl TokenValidator {
    #[must_use]
    pub const fn new(ring: Arc<KeyRing>) -> Self {
        Self { ring }
    }

    /// Validate signature, expiry, and token type.
    ///
    /// Key resolution: a `kid` header selects exactly one ring member; a
    /// token without `kid` (not something this crate issues) is tried
    /// against every currently valid key, current first.
    pub fn validate(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        if header.alg != PINNED_ALGORITHM {
            return Err(TokenError::AlgorithmMismatch);
        }

        let now = Utc::now();
        let claims = match header.kid {
            Some(kid) => {
                let key = self
                    .ring
                    .verification_key(&kid, now)
                    .ok_or(TokenError::UnknownKey)?;
                Self::decode_with(token, key.secret())?
            }
            None => {
                let mut last = TokenError::UnknownKey;
                let mut decoded = None;
                for key in self.ring.verification_keys(now) {
                    match Self::decode_with(token, key.secret()) {
                        Ok(claims) => {
                            decoded = Some(claims);
                            break;
                        }
                        // Expiry is terminal no matter which key signed it
                        Err(TokenError::Expired) => return Err(TokenError::Expired),
                        Err(e) => last = e,
                    }
                }
                decoded.ok_or(last)?
            }
        };

        if claims.typ != expected {
            return Err(TokenError::WrongType {
                expected,
                actual: claims.typ,
            });
        }
        Ok(claims)
    }

    fn decode_with(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(PINNED_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;

        decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            })
    }
}
