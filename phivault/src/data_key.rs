//! Ephemeral data encryption keys.
//!
//! A [`DataKey`] holds the raw 256-bit key produced by a gateway for exactly
//! one seal or open call. It cannot be cloned and its bytes are zeroed when
//! it is dropped, which covers early returns, errors and cancelled futures.
//!
//! The bytes live in a single heap buffer that is written in place, so
//! moving a key between the gateway, the service and a future's state moves
//! only the pointer and leaves no stray copies of the key behind.

use crate::error::GatewayError;
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use std::fmt;
use zeroize::Zeroize;

/// Data key size in bytes (256 bits).
pub const DATA_KEY_SIZE: usize = 32;

/// Raw data key material, wiped on drop.
pub struct DataKey {
    bytes: Box<[u8; DATA_KEY_SIZE]>,
    #[cfg(test)]
    recorder: Option<recorder::WipeRecorder>,
}

impl DataKey {
    fn zeroed() -> Self {
        Self {
            bytes: Box::new([0u8; DATA_KEY_SIZE]),
            #[cfg(test)]
            recorder: None,
        }
    }

    /// Draws a fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Self::zeroed();
        OsRng.fill_bytes(key.bytes.as_mut_slice());
        key
    }

    /// Copies key material out of a slice returned by a key service.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MissingKeyMaterial` if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.len() != DATA_KEY_SIZE {
            return Err(GatewayError::MissingKeyMaterial(format!(
                "data key must be {DATA_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Self::zeroed();
        key.bytes.copy_from_slice(bytes);
        Ok(key)
    }

    /// Takes ownership of a key buffer, zeroing the buffer after copying it.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MissingKeyMaterial` if the buffer is not 32 bytes.
    pub fn from_vec(mut bytes: Vec<u8>) -> Result<Self, GatewayError> {
        let key = Self::from_slice(&bytes);
        bytes.zeroize();
        key
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8; DATA_KEY_SIZE] {
        &self.bytes
    }

    #[cfg(test)]
    pub(crate) fn with_recorder(bytes: &[u8; DATA_KEY_SIZE], recorder: recorder::WipeRecorder) -> Self {
        let mut key = Self::zeroed();
        key.bytes.copy_from_slice(bytes);
        key.recorder = Some(recorder);
        key
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        #[cfg(test)]
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.bytes);
        }
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey").field("bytes", &"[REDACTED]").finish()
    }
}
