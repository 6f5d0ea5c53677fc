//! Envelope encryption service.
//!
//! Every sealed value gets its own data key:
//! 1. Ask the gateway for a fresh data key wrapped under the master key
//! 2. Encrypt the value with the raw data key (AES-256-GCM)
//! 3. Wipe the raw data key
//! 4. Return the ciphertext together with the wrapped key
//!
//! Opening reverses this: unwrap the data key through the gateway, decrypt,
//! wipe. Raw data keys never outlive the call that produced them.

use crate::cipher::{self, ALGORITHM, NONCE_SIZE};
use crate::config::{self, VaultConfig, DEFAULT_KMS_TIMEOUT};
use crate::data_key::DataKey;
use crate::error::{Error, GatewayError};
use crate::gateway::{GeneratedDataKey, KeyWrappingGateway};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A sealed value, ready to be written to storage.
///
/// `ciphertext` and `wrapped_data_key` must be stored and read together;
/// neither is useful without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
    /// Base64 packaged blob: nonce, tag, ciphertext.
    pub ciphertext: String,
    /// Base64 of the data key wrapped under the master key.
    pub wrapped_data_key: String,
    /// Master key that wrapped the data key.
    pub master_key_id: String,
    /// AEAD scheme used for `ciphertext`.
    pub algorithm: String,
    /// When the value was sealed.
    pub created_at: DateTime<Utc>,
}

/// Seals and opens individual field values with envelope encryption.
///
/// # Example
///
/// ```ignore
/// use phivault::envelope::EnvelopeService;
/// use phivault_key_file::FileKeyGateway;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let master_key_id = FileKeyGateway::init("./keys")?;
/// let gateway = FileKeyGateway::new("./keys")?;
/// let service = EnvelopeService::new(gateway, master_key_id);
///
/// let sealed = service.seal("MRN-00412").await?;
/// let plaintext = service.open(&sealed.ciphertext, &sealed.wrapped_data_key).await?;
///
/// assert_eq!(plaintext, "MRN-00412");
/// # Ok(())
/// # }
/// ```
pub struct EnvelopeService<G: KeyWrappingGateway> {
    gateway: Arc<G>,
    master_key_id: Option<String>,
    timeout: Duration,
    nonce: fn() -> [u8; NONCE_SIZE],
}

impl<G: KeyWrappingGateway> EnvelopeService<G> {
    /// Creates a service that wraps data keys under `master_key_id`.
    ///
    /// A blank id is treated as unset; every operation then fails with
    /// `Error::Configuration` before contacting the gateway.
    pub fn new(gateway: G, master_key_id: impl Into<String>) -> Self {
        let master_key_id = master_key_id.into();
        let master_key_id =
            if master_key_id.trim().is_empty() { None } else { Some(master_key_id) };
        Self {
            gateway: Arc::new(gateway),
            master_key_id,
            timeout: DEFAULT_KMS_TIMEOUT,
            nonce: cipher::random_nonce,
        }
    }

    /// Creates a service from loaded configuration.
    pub fn from_config(gateway: G, config: &VaultConfig) -> Self {
        Self::new(gateway, config.master_key_id.clone().unwrap_or_default())
            .with_timeout(config.kms_timeout)
    }

    /// Sets the bound applied to every gateway call.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the configured master key id, if any.
    #[must_use]
    pub fn master_key_id(&self) -> Option<&str> {
        self.master_key_id.as_deref()
    }

    /// Returns the gateway shared by this service.
    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Seals `plaintext` under a fresh data key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no master key id is configured,
    /// `Error::KeyService` if the gateway fails or times out, and
    /// `Error::Integrity` for integrity-class gateway failures.
    pub async fn seal(&self, plaintext: &str) -> Result<EncryptedField, Error> {
        let master_key_id = self.require_master_key_id()?;

        let GeneratedDataKey { key, wrapped_key, key_id } =
            self.bounded(self.gateway.generate_data_key(master_key_id)).await.map_err(|e| {
                warn!(error = %e, master_key_id, "data key generation failed");
                e
            })?;

        let sealed = cipher::seal_with_nonce(plaintext, key.expose(), (self.nonce)());
        drop(key);
        let ciphertext = sealed?;

        let resolved_key_id = key_id.unwrap_or_else(|| master_key_id.to_string());
        debug!(
            master_key_id = %resolved_key_id,
            ciphertext_len = ciphertext.len(),
            "sealed field value"
        );

        Ok(EncryptedField {
            ciphertext,
            wrapped_data_key: STANDARD.encode(wrapped_key),
            master_key_id: resolved_key_id,
            algorithm: ALGORITHM.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Opens a value sealed by [`Self::seal`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no master key id is configured,
    /// `Error::Integrity` if the wrapped key is malformed or its master key
    /// is gone, `Error::KeyService` if the gateway fails or times out, and
    /// `Error::Decryption` if the ciphertext fails authentication.
    pub async fn open(&self, ciphertext: &str, wrapped_data_key: &str) -> Result<String, Error> {
        self.require_master_key_id()?;

        let wrapped = STANDARD.decode(wrapped_data_key).map_err(|e| {
            Error::Integrity(format!("wrapped data key is not valid base64: {e}"))
        })?;

        let key: DataKey =
            self.bounded(self.gateway.unwrap_data_key(&wrapped)).await.map_err(|e| {
                warn!(error = %e, "data key unwrap failed");
                e
            })?;

        let opened = cipher::open(ciphertext, key.expose());
        drop(key);

        match opened {
            Ok(plaintext) => {
                debug!(ciphertext_len = ciphertext.len(), "opened field value");
                Ok(plaintext)
            }
            Err(e) => {
                warn!(error = %e, "field value failed to open");
                Err(e)
            }
        }
    }

    /// Opens a sealed [`EncryptedField`].
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn open_field(&self, field: &EncryptedField) -> Result<String, Error> {
        self.open(&field.ciphertext, &field.wrapped_data_key).await
    }

    /// Re-seals a stored value under the currently configured master key.
    ///
    /// Used after a master key rotation to move values off the old key.
    /// The value gets a new data key and a new nonce.
    ///
    /// # Errors
    ///
    /// See [`Self::open`] and [`Self::seal`].
    pub async fn reseal(
        &self,
        ciphertext: &str,
        wrapped_data_key: &str,
    ) -> Result<EncryptedField, Error> {
        let plaintext = self.open(ciphertext, wrapped_data_key).await?;
        self.seal(&plaintext).await
    }

    fn require_master_key_id(&self) -> Result<&str, Error> {
        self.master_key_id.as_deref().ok_or_else(|| {
            Error::Configuration(format!("{} is not configured", config::ENV_MASTER_KEY_ID))
        })
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::from(GatewayError::Timeout(self.timeout))),
        }
    }

    #[cfg(test)]
    fn with_fixed_nonce(mut self, nonce: fn() -> [u8; NONCE_SIZE]) -> Self {
        self.nonce = nonce;
        self
    }
}

impl<G: KeyWrappingGateway> Clone for EnvelopeService<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            master_key_id: self.master_key_id.clone(),
            timeout: self.timeout,
            nonce: self.nonce,
        }
    }
}
