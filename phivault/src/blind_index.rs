//! Blind index generation for searchable encryption.
//!
//! Blind indexes allow equality queries and uniqueness constraints on
//! encrypted columns without revealing the plaintext. The tag is
//! `hex(HMAC-SHA256(index_key, normalized_value))`, using a static key that
//! is distinct from every data key and from the master key.
//!
//! Tags are deterministic on purpose. Anyone who can read the index column
//! learns which rows share a value, which is the price of searchability.

use crate::config::{self, VaultConfig};
use crate::error::Error;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use std::borrow::Cow;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Index key size in bytes (256 bits).
pub const INDEX_KEY_SIZE: usize = 32;

/// Length of a rendered index tag (hex of a full SHA-256 MAC).
pub const INDEX_TAG_LEN: usize = 64;

/// How a field's value is canonicalized before indexing.
///
/// The same rule must be applied when writing a row and when building a
/// lookup; a mismatch silently breaks equality search and duplicate
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Use the value byte-for-byte.
    #[default]
    Verbatim,
    /// Strip leading and trailing whitespace.
    Trimmed,
    /// Lower-case the value.
    CaseFolded,
    /// Strip surrounding whitespace and lower-case (email addresses).
    Email,
}

impl Normalization {
    /// Applies the rule to `value`.
    #[must_use]
    pub fn apply<'a>(self, value: &'a str) -> Cow<'a, str> {
        match self {
            Self::Verbatim => Cow::Borrowed(value),
            Self::Trimmed => Cow::Borrowed(value.trim()),
            Self::CaseFolded => Cow::Owned(value.to_lowercase()),
            Self::Email => Cow::Owned(value.trim().to_lowercase()),
        }
    }
}

/// Computes deterministic index tags under a static key.
///
/// # Example
///
/// ```
/// use phivault::blind_index::{BlindIndexer, Normalization};
/// use secrecy::SecretVec;
///
/// let indexer = BlindIndexer::new(SecretVec::new(vec![7u8; 32])).unwrap();
/// let a = indexer.index_value("Alice@Example.com ", Normalization::Email).unwrap();
/// let b = indexer.index_value("alice@example.com", Normalization::Email).unwrap();
/// assert_eq!(a, b);
/// ```
pub struct BlindIndexer {
    key: SecretVec<u8>,
}

impl BlindIndexer {
    /// Creates an indexer from raw key material.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key is not 32 bytes.
    pub fn new(key: SecretVec<u8>) -> Result<Self, Error> {
        let len = key.expose_secret().len();
        if len != INDEX_KEY_SIZE {
            return Err(Error::Configuration(format!(
                "index key must be {INDEX_KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { key })
    }

    /// Creates an indexer from the base64 form used in the environment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for invalid base64 or a wrong key length.
    pub fn from_base64(b64: &str) -> Result<Self, Error> {
        Self::new(config::decode_index_key(b64)?)
    }

    /// Creates an indexer from loaded configuration.
    ///
    /// Call this at startup: a missing key fails here instead of leaving
    /// index columns empty later.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if no index key is configured.
    pub fn from_config(config: &VaultConfig) -> Result<Self, Error> {
        let key = config.index_key.as_ref().ok_or_else(|| {
            Error::Configuration(format!("{} is not configured", config::ENV_INDEX_KEY))
        })?;
        Self::new(SecretVec::new(key.expose_secret().clone()))
    }

    /// Computes the tag of an already-normalized value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the HMAC cannot be keyed.
    pub fn compute_index(&self, normalized: &str) -> Result<String, Error> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::Configuration(format!("invalid index key: {e}")))?;
        mac.update(normalized.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Normalizes `value` with `normalization` and computes its tag.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the HMAC cannot be keyed.
    pub fn index_value(&self, value: &str, normalization: Normalization) -> Result<String, Error> {
        self.compute_index(&normalization.apply(value))
    }
}

impl fmt::Debug for BlindIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlindIndexer").field("key", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use proptest::prelude::*;

    fn indexer() -> BlindIndexer {
        BlindIndexer::new(SecretVec::new(vec![42u8; INDEX_KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_blind_index_deterministic() {
        let indexer = indexer();

        let index1 = indexer.compute_index("Pneumothorax").unwrap();
        let index2 = indexer.compute_index("Pneumothorax").unwrap();

        assert_eq!(index1, index2);
        assert_eq!(index1.len(), INDEX_TAG_LEN);
        assert!(index1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_blind_index_different_values() {
        let indexer = indexer();

        let index1 = indexer.compute_index("alice@example.com").unwrap();
        let index2 = indexer.compute_index("bob@example.com").unwrap();

        assert_ne!(index1, index2);
    }

    #[test]
    fn test_blind_index_different_keys() {
        let other = BlindIndexer::new(SecretVec::new(vec![43u8; INDEX_KEY_SIZE])).unwrap();

        assert_ne!(
            indexer().compute_index("Finding-1").unwrap(),
            other.compute_index("Finding-1").unwrap()
        );
    }

    // RFC 4231 Test Vector (HMAC-SHA256)
    // https://tools.ietf.org/html/rfc4231#section-4.3
    // Test Case 2: short key, so it cannot go through BlindIndexer::new
    #[test]
    fn test_hmac_sha256_rfc4231_test_case_2() {
        let mut mac = HmacSha256::new_from_slice(b"Jefe").unwrap();
        mac.update(b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_blind_index_empty_value() {
        let index = indexer().compute_index("").unwrap();
        assert_eq!(index.len(), INDEX_TAG_LEN);
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let result = BlindIndexer::new(SecretVec::new(vec![1u8; 16]));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_from_base64() {
        let b64 = STANDARD.encode([42u8; INDEX_KEY_SIZE]);
        let from_env = BlindIndexer::from_base64(&b64).unwrap();

        assert_eq!(from_env.compute_index("x").unwrap(), indexer().compute_index("x").unwrap());
        assert!(matches!(BlindIndexer::from_base64("***"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_from_config_requires_key() {
        let result = BlindIndexer::from_config(&VaultConfig::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_email_normalization() {
        let indexer = indexer();

        let written = indexer.index_value("  Alice@Example.COM", Normalization::Email).unwrap();
        let queried = indexer.index_value("alice@example.com ", Normalization::Email).unwrap();
        assert_eq!(written, queried);

        let verbatim = indexer.index_value("Alice@Example.COM", Normalization::Verbatim).unwrap();
        assert_ne!(written, verbatim);
    }

    #[test]
    fn test_normalization_rules() {
        assert_eq!(Normalization::Verbatim.apply(" A "), " A ");
        assert_eq!(Normalization::Trimmed.apply(" A "), "A");
        assert_eq!(Normalization::CaseFolded.apply(" A "), " a ");
        assert_eq!(Normalization::Email.apply(" A@B.C "), "a@b.c");
    }

    #[test]
    fn test_debug_is_redacted() {
        assert_eq!(format!("{:?}", indexer()), "BlindIndexer { key: \"[REDACTED]\" }");
    }

    proptest! {
        #[test]
        fn prop_index_is_deterministic(value in ".*") {
            let indexer = indexer();
            prop_assert_eq!(indexer.compute_index(&value).unwrap(), indexer.compute_index(&value).unwrap());
        }

        #[test]
        fn prop_distinct_values_distinct_tags(a in ".{0,32}", b in ".{0,32}") {
            prop_assume!(a != b);
            let indexer = indexer();
            prop_assert_ne!(indexer.compute_index(&a).unwrap(), indexer.compute_index(&b).unwrap());
        }
    }
}
