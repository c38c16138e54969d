//! AES-256-GCM sealing for stored secrets.
//!
//! Every record is sealed with a fresh random nonce. The storage key is bound as
//! associated data, so a record moved to another key no longer opens.
//! The master key must be 32 bytes (256 bits) and is provided from an environment variable.
//!
//! Sealed layout: `MAGIC (4) || nonce (12) || ciphertext || tag (16)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag
const TAG_SIZE: usize = 16;

/// Format marker for sealed records
pub const MAGIC: &[u8; 4] = b"AGv1";

/// Why a stored value could not be opened.
#[derive(Debug, Error, PartialEq)]
pub enum OpenError {
    /// The bytes are not a sealed record at all (legacy plaintext)
    #[error("value is not sealed ciphertext")]
    NotCiphertext,

    /// The bytes look sealed but authentication failed
    #[error("decryption failed: {0}")]
    Rejected(String),
}

/// Validates that the master key is exactly 32 bytes when base64 decoded.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Returns true if `bytes` carries the sealed-record framing.
///
/// Framing is only the magic prefix plus a minimum length. A legacy
/// plaintext value of 32 bytes or more that happens to begin with `AGv1`
/// is therefore treated as sealed; [`open`] then rejects it and the store
/// reports `DecodingFailed` instead of migrating it. Such values have to be
/// rewritten by the caller with a plain `save`.
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() + NONCE_SIZE + TAG_SIZE && bytes.starts_with(MAGIC)
}

/// Seals `plaintext` under `key`, binding `aad` (the storage key).
///
/// # Security
/// - Uses a cryptographically secure random nonce (never reuse)
/// - Authenticated encryption (tampering detected)
pub fn seal(plaintext: &[u8], aad: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut sealed = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(MAGIC);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a sealed record produced by [`seal`] with the same key and `aad`.
///
/// Returns [`OpenError::NotCiphertext`] when the bytes lack the sealed framing,
/// which is the signal for legacy plaintext migration.
pub fn open(sealed: &[u8], aad: &[u8], key: &[u8]) -> Result<Vec<u8>, OpenError> {
    if !is_sealed(sealed) {
        return Err(OpenError::NotCiphertext);
    }
    if key.len() != KEY_SIZE {
        return Err(OpenError::Rejected(format!(
            "encryption key must be {} bytes",
            KEY_SIZE
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| OpenError::Rejected(format!("failed to create cipher: {}", e)))?;

    let (nonce_bytes, ciphertext) = sealed[MAGIC.len()..].split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| OpenError::Rejected("wrong key, wrong record key, or corrupted data".into()))
}
