//! Configuration loaded from the process environment.

use crate::blind_index::INDEX_KEY_SIZE;
use crate::error::Error;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use std::time::Duration;

/// Master key id or ARN used to wrap data keys.
pub const ENV_MASTER_KEY_ID: &str = "AWS_KMS_KEY_ID";
/// Region of the key-management service.
pub const ENV_REGION: &str = "AWS_REGION";
/// Optional endpoint override for the key-management service.
pub const ENV_KMS_ENDPOINT: &str = "AWS_KMS_ENDPOINT";
/// Base64-encoded 256-bit key for blind indexes.
pub const ENV_INDEX_KEY: &str = "FINDING_INDEX_KEY_BASE64";
/// Upper bound for a single key-service call, in milliseconds.
pub const ENV_KMS_TIMEOUT_MS: &str = "PHIVAULT_KMS_TIMEOUT_MS";

/// Default bound for a single key-service call.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings consumed by the envelope service, the blind indexer and the
/// AWS gateway.
///
/// Absent values are kept as `None` here; the component that needs them
/// refuses to operate with `Error::Configuration`. Values that are present
/// but malformed are rejected while loading.
pub struct VaultConfig {
    /// Master key id or ARN.
    pub master_key_id: Option<String>,
    /// Key-management service region.
    pub region: Option<String>,
    /// Key-management service endpoint override.
    pub kms_endpoint: Option<String>,
    /// Static blind index key.
    pub index_key: Option<SecretVec<u8>>,
    /// Bound for each key-service call.
    pub kms_timeout: Duration,
}

impl VaultConfig {
    /// Loads the configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a variable is set but malformed.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through an arbitrary key/value lookup.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a value is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty =
            |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let index_key = non_empty(ENV_INDEX_KEY).map(|b64| decode_index_key(&b64)).transpose()?;

        let kms_timeout = match non_empty(ENV_KMS_TIMEOUT_MS) {
            Some(raw) => {
                let millis: u64 = raw.parse().map_err(|_| {
                    Error::Configuration(format!(
                        "{ENV_KMS_TIMEOUT_MS} must be an integer, got {raw:?}"
                    ))
                })?;
                if millis == 0 {
                    return Err(Error::Configuration(format!(
                        "{ENV_KMS_TIMEOUT_MS} must be positive"
                    )));
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_KMS_TIMEOUT,
        };

        Ok(Self {
            master_key_id: non_empty(ENV_MASTER_KEY_ID),
            region: non_empty(ENV_REGION),
            kms_endpoint: non_empty(ENV_KMS_ENDPOINT),
            index_key,
            kms_timeout,
        })
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key_id: None,
            region: None,
            kms_endpoint: None,
            index_key: None,
            kms_timeout: DEFAULT_KMS_TIMEOUT,
        }
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_key_id", &self.master_key_id)
            .field("region", &self.region)
            .field("kms_endpoint", &self.kms_endpoint)
            .field("index_key", &self.index_key.as_ref().map(|_| "[REDACTED]"))
            .field("kms_timeout", &self.kms_timeout)
            .finish()
    }
}

/// Decodes a base64 index key and checks its length.
///
/// # Errors
///
/// Returns `Error::Configuration` for invalid base64 or a key that is not
/// 32 bytes.
pub fn decode_index_key(b64: &str) -> Result<SecretVec<u8>, Error> {
    let key = SecretVec::new(
        STANDARD
            .decode(b64.trim())
            .map_err(|e| Error::Configuration(format!("{ENV_INDEX_KEY} is not valid base64: {e}")))?,
    );
    let len = key.expose_secret().len();
    if len != INDEX_KEY_SIZE {
        return Err(Error::Configuration(format!(
            "{ENV_INDEX_KEY} must decode to {INDEX_KEY_SIZE} bytes, got {len}"
        )));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<VaultConfig, Error> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        VaultConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_full_config() {
        let key = STANDARD.encode([5u8; 32]);
        let config = load(&[
            (ENV_MASTER_KEY_ID, "arn:aws:kms:eu-west-1:123456789012:key/abc"),
            (ENV_REGION, "eu-west-1"),
            (ENV_INDEX_KEY, &key),
            (ENV_KMS_TIMEOUT_MS, "2500"),
        ])
        .unwrap();

        assert_eq!(config.master_key_id.as_deref(), Some("arn:aws:kms:eu-west-1:123456789012:key/abc"));
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.kms_endpoint, None);
        assert_eq!(config.index_key.unwrap().expose_secret(), &vec![5u8; 32]);
        assert_eq!(config.kms_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_absent_values_stay_unset() {
        let config = load(&[(ENV_MASTER_KEY_ID, "   ")]).unwrap();
        assert!(config.master_key_id.is_none());
        assert!(config.index_key.is_none());
        assert_eq!(config.kms_timeout, DEFAULT_KMS_TIMEOUT);
    }

    #[test]
    fn test_malformed_index_key_rejected() {
        assert!(matches!(load(&[(ENV_INDEX_KEY, "%%%")]), Err(Error::Configuration(_))));

        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(load(&[(ENV_INDEX_KEY, &short)]), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_malformed_timeout_rejected() {
        assert!(matches!(load(&[(ENV_KMS_TIMEOUT_MS, "soon")]), Err(Error::Configuration(_))));
        assert!(matches!(load(&[(ENV_KMS_TIMEOUT_MS, "0")]), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_debug_redacts_index_key() {
        let key = STANDARD.encode([0x7Fu8; 32]);
        let config = load(&[(ENV_INDEX_KEY, &key)]).unwrap();
        let rendered = format!("{config:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&key));
    }
}
