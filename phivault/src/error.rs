//! Error types for `PhiVault` operations.

use std::fmt;
use std::time::Duration;

/// Main error type for `PhiVault` operations.
///
/// Every variant maps onto one [`ErrorKind`]. The envelope service and the
/// record codec propagate these unchanged so callers can tell a corrupted
/// value apart from an unreachable key service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required key material is missing or malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The key-management service call failed
    #[error("key service error: {0}")]
    KeyService(GatewayError),

    /// Authentication failed or the blob is structurally invalid
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Stored key material is invalid or was wrapped under a key that is gone
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A record handed to the codec cannot be encoded
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Coarse classification of an [`Error`], used for retry and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration.
    Configuration,
    /// Key service failure (network, authorization, timeout).
    KeyService,
    /// Ciphertext corrupted or tampered.
    Decryption,
    /// Data-at-rest problem requiring operator intervention.
    Integrity,
    /// Caller supplied an unusable record.
    InvalidInput,
}

impl Error {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::KeyService(_) => ErrorKind::KeyService,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether retrying the same call with backoff may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyService(_))
    }
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        if err.is_integrity() {
            Self::Integrity(err.to_string())
        } else {
            Self::KeyService(err)
        }
    }
}

/// Errors reported by a key-wrapping gateway.
#[derive(Debug)]
pub enum GatewayError {
    /// Service unreachable or failed internally
    Unavailable(String),

    /// The call did not complete within the configured bound
    Timeout(Duration),

    /// The calling identity may not use the key
    AccessDenied(String),

    /// Master key id unknown, disabled or unusable for data keys
    InvalidKeyId(String),

    /// The response omitted the raw or wrapped key, or had the wrong size
    MissingKeyMaterial(String),

    /// The wrapped key blob is malformed or fails authentication
    InvalidCiphertext(String),

    /// The wrapped key was produced under a master key the service no longer holds
    KeyUnavailable(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl GatewayError {
    /// Whether this failure points at the stored wrapped key rather than the service.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::InvalidCiphertext(_) | Self::KeyUnavailable(_))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "key service unavailable: {msg}"),
            Self::Timeout(after) => write!(f, "key service timed out after {}ms", after.as_millis()),
            Self::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            Self::InvalidKeyId(id) => write!(f, "invalid master key id: {id}"),
            Self::MissingKeyMaterial(msg) => write!(f, "missing key material: {msg}"),
            Self::InvalidCiphertext(msg) => write!(f, "wrapped key rejected: {msg}"),
            Self::KeyUnavailable(msg) => write!(f, "master key no longer available: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_integrity_errors_map_to_integrity() {
        let err: Error = GatewayError::InvalidCiphertext("bad blob".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Integrity);

        let err: Error = GatewayError::KeyUnavailable("revoked".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_gateway_service_errors_map_to_key_service() {
        let err: Error = GatewayError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(err.kind(), ErrorKind::KeyService);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "key service error: key service timed out after 250ms");

        let err: Error = GatewayError::AccessDenied("role".to_string()).into();
        assert!(matches!(err, Error::KeyService(GatewayError::AccessDenied(_))));
    }

    #[test]
    fn test_only_key_service_is_retryable() {
        assert!(!Error::Configuration("x".to_string()).is_retryable());
        assert!(!Error::Decryption("x".to_string()).is_retryable());
        assert!(!Error::Integrity("x".to_string()).is_retryable());
        assert!(!Error::InvalidInput("x".to_string()).is_retryable());
    }
}
