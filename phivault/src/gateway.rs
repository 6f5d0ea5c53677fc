//! Key-wrapping gateway abstraction.
//!
//! A gateway delegates custody of master keys to an external authority
//! (a cloud KMS, an HSM, a key directory). It produces fresh data keys
//! together with their wrapped form, and unwraps stored data keys.

use crate::data_key::DataKey;
use crate::error::GatewayError;
use async_trait::async_trait;

/// A freshly generated data key and its wrapped form.
#[derive(Debug)]
pub struct GeneratedDataKey {
    /// Raw key, used once and then wiped.
    pub key: DataKey,
    /// The key wrapped under the master key; opaque to this crate.
    pub wrapped_key: Vec<u8>,
    /// The master key id the service reports having used, if any.
    pub key_id: Option<String>,
}

/// Delegates data-key generation and unwrapping to a key authority.
///
/// Implementations must be thread-safe (`Send + Sync`) and must accept
/// concurrent outstanding calls; the envelope service shares one gateway
/// across all requests.
///
/// # Example
///
/// ```rust,ignore
/// use phivault::gateway::{GeneratedDataKey, KeyWrappingGateway};
///
/// struct MyGateway;
///
/// #[async_trait::async_trait]
/// impl KeyWrappingGateway for MyGateway {
///     async fn generate_data_key(&self, master_key_id: &str) -> Result<GeneratedDataKey, GatewayError> {
///         // Implementation
///     }
///     // ... other methods
/// }
/// ```
#[async_trait]
pub trait KeyWrappingGateway: Send + Sync {
    /// Generates a random 256-bit data key wrapped under `master_key_id`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidKeyId` or `GatewayError::AccessDenied`
    /// when the master key cannot be used, `GatewayError::MissingKeyMaterial`
    /// if the response lacks either form of the key, and
    /// `GatewayError::Unavailable` for transport failures.
    async fn generate_data_key(&self, master_key_id: &str)
        -> Result<GeneratedDataKey, GatewayError>;

    /// Unwraps a data key previously returned by [`Self::generate_data_key`].
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidCiphertext` if the blob is malformed,
    /// `GatewayError::KeyUnavailable` if its master key is no longer held,
    /// and service-class errors as for generation.
    async fn unwrap_data_key(&self, wrapped_key: &[u8]) -> Result<DataKey, GatewayError>;
}
