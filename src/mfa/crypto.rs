//! TOTP secret encryption
//!
//! AES-256-GCM with a random 96-bit nonce per encryption. The stored form is
//! `hex(nonce || ciphertext)`; the nonce travels with the ciphertext so no
//! extra bookkeeping is needed, and GCM's tag authenticates the whole blob.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes
const TAG_LEN: usize = 16;
/// Required key length for AES-256
const KEY_LEN: usize = 32;

/// Failures in the secret encryption layer
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Key is not exactly 32 bytes
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption failed")]
    EncryptFailed,

    /// Wrong key, corrupted blob, or tampering
    #[error("decryption failed")]
    DecryptFailed,

    /// Blob is too short to contain a nonce and tag
    #[error("ciphertext is malformed")]
    InvalidCiphertext,

    #[error("hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Encrypt a plaintext secret for storage
pub fn encrypt_secret(plaintext: &str, key: &[u8]) -> Result<String, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(hex::encode(blob))
}

/// Decrypt a stored secret back to plaintext
pub fn decrypt_secret(stored: &str, key: &[u8]) -> Result<String, CryptoError> {
    let cipher = cipher_for(key)?;
    let blob = hex::decode(stored)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidCiphertext);
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}
