//! Symmetric field cipher.
//!
//! AES-256-GCM over a single UTF-8 string. The output is one text-safe blob:
//!
//! ```text
//! base64( [nonce:12][tag:16][ciphertext:N] )
//! ```
//!
//! Every call to [`seal`] draws a fresh nonce from the OS RNG. Reusing a
//! nonce under the same key breaks both confidentiality and authenticity,
//! so callers never supply one.

use crate::error::Error;
use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Algorithm tag recorded alongside every sealed value.
pub const ALGORITHM: &str = "AES-256-GCM";

/// Key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Smallest well-formed blob: nonce and tag around an empty ciphertext.
pub const MIN_BLOB_SIZE: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypts `plaintext` under `key` and returns the packaged blob.
///
/// # Errors
///
/// Returns `Error::Configuration` if the key is not 32 bytes.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String, Error> {
    seal_with_nonce(plaintext, key, random_nonce())
}

/// Decrypts a blob produced by [`seal`].
///
/// # Errors
///
/// Returns `Error::Configuration` if the key is not 32 bytes, and
/// `Error::Decryption` if the blob is not valid base64, is shorter than
/// nonce plus tag, fails authentication, or does not decrypt to UTF-8.
pub fn open(blob: &str, key: &[u8]) -> Result<String, Error> {
    let cipher = cipher_for(key)?;

    let data = STANDARD
        .decode(blob)
        .map_err(|e| Error::Decryption(format!("blob is not valid base64: {e}")))?;
    if data.len() < MIN_BLOB_SIZE {
        return Err(Error::Decryption(format!(
            "blob too short: {} bytes (min: {MIN_BLOB_SIZE})",
            data.len()
        )));
    }

    let (nonce, rest) = data.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| {
            Error::Decryption("authentication failed: blob corrupted or tampered".to_string())
        })?;

    String::from_utf8(buffer)
        .map_err(|_| Error::Decryption("plaintext is not valid UTF-8".to_string()))
}

pub(crate) fn seal_with_nonce(
    plaintext: &str,
    key: &[u8],
    nonce: [u8; NONCE_SIZE],
) -> Result<String, Error> {
    let cipher = cipher_for(key)?;

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| Error::InvalidInput(format!("AES-256-GCM encryption failed: {e}")))?;

    let mut packaged = Vec::with_capacity(MIN_BLOB_SIZE + buffer.len());
    packaged.extend_from_slice(&nonce);
    packaged.extend_from_slice(&tag);
    packaged.extend_from_slice(&buffer);

    Ok(STANDARD.encode(packaged))
}

pub(crate) fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, Error> {
    if key.len() != KEY_SIZE {
        return Err(Error::Configuration(format!(
            "field key must be {KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Configuration(format!("invalid field key: {e}")))
}
