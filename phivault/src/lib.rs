//! # `PhiVault`
//!
//! Field-level protection for PHI-bearing columns: envelope encryption with
//! per-value data keys, deterministic blind indexes for equality search, and
//! a record codec that tolerates plaintext and ciphertext side by side while
//! a table is being migrated.
//!
//! ## Features
//!
//! - AES-256-GCM with a fresh data key and nonce for every value
//! - Data keys generated and unwrapped by an external key authority
//! - HMAC-SHA256 blind indexes under a separate static key
//! - Bounded key-service calls with a retryable error class
//! - Column mapping for `<field>_ciphertext` / `<field>_encrypted_dek` pairs
//!
//! ## Example
//!
//! ```rust,ignore
//! use phivault::prelude::*;
//! use phivault_key_file::FileKeyGateway;
//!
//! let config = VaultConfig::from_env()?;
//! let service = EnvelopeService::from_config(FileKeyGateway::new("./keys")?, &config);
//!
//! let field = service.seal("Pneumothorax").await?;
//! let plaintext = service.open_field(&field).await?;
//!
//! let indexer = BlindIndexer::from_config(&config)?;
//! let tag = indexer.compute_index("Pneumothorax")?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blind_index;
pub mod cipher;
pub mod config;
pub mod data_key;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod record;

pub use error::{Error, ErrorKind, GatewayError};

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::blind_index::{BlindIndexer, Normalization};
    pub use crate::config::VaultConfig;
    pub use crate::data_key::DataKey;
    pub use crate::envelope::{EncryptedField, EnvelopeService};
    pub use crate::error::{Error, ErrorKind, GatewayError};
    pub use crate::gateway::{GeneratedDataKey, KeyWrappingGateway};
    pub use crate::record::{FieldSpec, RecordCodec, Row, StoredField};
}
