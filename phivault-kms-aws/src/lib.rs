//! AWS KMS key-wrapping gateway for `PhiVault`.
//!
//! Master keys never leave KMS. Data keys are produced with
//! `GenerateDataKey` (`AES_256`) and unwrapped with `Decrypt`; the KMS
//! ciphertext blob is stored as the wrapped data key and carries its own
//! key reference, so `Decrypt` needs no key id.
//!
//! # Example
//!
//! ```rust,no_run
//! use phivault::prelude::*;
//! use phivault_kms_aws::AwsKmsGateway;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VaultConfig::from_env()?;
//! let gateway = AwsKmsGateway::from_config(&config).await;
//! let service = EnvelopeService::from_config(gateway, &config);
//!
//! let field = service.seal("MRN-00412").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The gateway uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (`~/.aws/credentials`)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_kms::operation::decrypt::DecryptError;
use aws_sdk_kms::operation::generate_data_key::{GenerateDataKeyError, GenerateDataKeyOutput};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use aws_sdk_kms::Client as KmsClient;
use phivault::config::VaultConfig;
use phivault::data_key::DataKey;
use phivault::gateway::{GeneratedDataKey, KeyWrappingGateway};
use phivault::GatewayError;
use tracing::debug;

const ACCESS_DENIED: &str = "AccessDeniedException";

/// AWS KMS gateway.
///
/// Cloning is cheap; the SDK client shares its connection pool.
#[derive(Debug, Clone)]
pub struct AwsKmsGateway {
    client: KmsClient,
}

impl AwsKmsGateway {
    /// Wraps an existing KMS client.
    #[must_use]
    pub const fn new(client: KmsClient) -> Self {
        Self { client }
    }

    /// Builds a client from the SDK's default chain, overriding region and
    /// endpoint with any values present in `config`.
    pub async fn from_config(config: &VaultConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.kms_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        Self::new(KmsClient::new(&loader.load().await))
    }

    /// Returns the underlying KMS client.
    #[must_use]
    pub const fn client(&self) -> &KmsClient {
        &self.client
    }
}

#[async_trait]
impl KeyWrappingGateway for AwsKmsGateway {
    async fn generate_data_key(
        &self,
        master_key_id: &str,
    ) -> Result<GeneratedDataKey, GatewayError> {
        let output = self
            .client
            .generate_data_key()
            .key_id(master_key_id)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| {
                let detail = DisplayErrorContext(&e).to_string();
                classify_generate_error(&e.into_service_error(), master_key_id, detail)
            })?;

        let GenerateDataKeyOutput { plaintext, ciphertext_blob, key_id, .. } = output;
        let plaintext = plaintext.ok_or_else(|| {
            GatewayError::MissingKeyMaterial("GenerateDataKey returned no plaintext".to_string())
        })?;
        // Take the key before checking the ciphertext so it is wiped on every path.
        let key = DataKey::from_vec(plaintext.into_inner())?;
        let wrapped_key = ciphertext_blob
            .ok_or_else(|| {
                GatewayError::MissingKeyMaterial(
                    "GenerateDataKey returned no ciphertext blob".to_string(),
                )
            })?
            .into_inner();

        debug!(key_id = ?key_id, wrapped_len = wrapped_key.len(), "generated KMS data key");
        Ok(GeneratedDataKey { key, wrapped_key, key_id })
    }

    async fn unwrap_data_key(&self, wrapped_key: &[u8]) -> Result<DataKey, GatewayError> {
        let output = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(wrapped_key.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let detail = DisplayErrorContext(&e).to_string();
                classify_decrypt_error(&e.into_service_error(), detail)
            })?;

        let plaintext = output.plaintext.ok_or_else(|| {
            GatewayError::MissingKeyMaterial("Decrypt returned no plaintext".to_string())
        })?;
        DataKey::from_vec(plaintext.into_inner())
    }
}

/// Maps a `GenerateDataKey` failure onto the gateway taxonomy.
fn classify_generate_error(
    err: &GenerateDataKeyError,
    master_key_id: &str,
    detail: String,
) -> GatewayError {
    if err.is_not_found_exception()
        || err.is_disabled_exception()
        || err.is_invalid_key_usage_exception()
        || err.is_kms_invalid_state_exception()
    {
        GatewayError::InvalidKeyId(format!("{master_key_id}: {}", message(err, detail)))
    } else if err.code() == Some(ACCESS_DENIED) {
        GatewayError::AccessDenied(message(err, detail))
    } else {
        GatewayError::Unavailable(detail)
    }
}

/// Maps a `Decrypt` failure onto the gateway taxonomy.
fn classify_decrypt_error(err: &DecryptError, detail: String) -> GatewayError {
    if err.is_invalid_ciphertext_exception() || err.is_incorrect_key_exception() {
        GatewayError::InvalidCiphertext(message(err, detail))
    } else if err.is_not_found_exception()
        || err.is_disabled_exception()
        || err.is_kms_invalid_state_exception()
    {
        GatewayError::KeyUnavailable(message(err, detail))
    } else if err.code() == Some(ACCESS_DENIED) {
        GatewayError::AccessDenied(message(err, detail))
    } else {
        GatewayError::Unavailable(detail)
    }
}

fn message<E: ProvideErrorMetadata>(err: &E, detail: String) -> String {
    err.message().map_or(detail, ToString::to_string)
}
