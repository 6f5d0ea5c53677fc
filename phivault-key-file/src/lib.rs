//! File-based key-wrapping gateway for `PhiVault`.
//!
//! Master keys live as raw 32-byte files in a local directory and data keys
//! are wrapped with ChaCha20-Poly1305. This gateway is meant for development,
//! tests and the CLI; production deployments use a managed key service.

#![warn(clippy::pedantic, clippy::nursery)]

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use phivault::data_key::DataKey;
use phivault::gateway::{GeneratedDataKey, KeyWrappingGateway};
use phivault::GatewayError;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

/// Version byte at the start of every wrapped key blob.
pub const BLOB_VERSION: u8 = 1;

/// Master key size in bytes.
pub const MASTER_KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const KEY_FILE_EXTENSION: &str = "key";
const MASTER_KEY_PREFIX: &str = "master_v";

/// File-based key-wrapping gateway for development and testing.
///
/// Keys are stored in the filesystem with the following structure:
/// ```text
/// keys/
/// ├── master_v1.key   (32 bytes, 0600 permissions)
/// └── master_v2.key   (32 bytes, 0600 permissions)
/// ```
///
/// A wrapped data key records the id of the master key that wrapped it:
/// ```text
/// [version:1][key_id_len:1][key_id:N][nonce:12][ciphertext+tag:48]
/// ```
/// The key id is also bound as associated data, so a blob cannot be
/// redirected to a different master key.
#[derive(Debug, Clone)]
pub struct FileKeyGateway {
    key_dir: PathBuf,
}

impl FileKeyGateway {
    /// Opens an existing key directory.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if the directory does not exist.
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(GatewayError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("key directory does not exist: {}", key_dir.display()),
            )));
        }
        Ok(Self { key_dir })
    }

    /// Creates the key directory if needed and adds a master key.
    ///
    /// On a fresh directory the new key is `master_v1`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if the directory or key file cannot be written.
    pub fn init(key_dir: impl Into<PathBuf>) -> Result<String, GatewayError> {
        let key_dir = key_dir.into();
        fs::create_dir_all(&key_dir)?;
        Self { key_dir }.create_master_key()
    }

    /// Returns the key directory.
    #[must_use]
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Writes a new random master key and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if the key file cannot be written.
    pub fn create_master_key(&self) -> Result<String, GatewayError> {
        let next = self.versions()?.last().map_or(1, |v| v + 1);
        let key_id = format!("{MASTER_KEY_PREFIX}{next}");

        let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        write_key_file(&self.key_path(&key_id), &key[..])?;

        debug!(key_id = %key_id, "created master key");
        Ok(key_id)
    }

    /// Lists master key ids, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if the directory cannot be read.
    pub fn master_key_ids(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.versions()?.into_iter().map(|v| format!("{MASTER_KEY_PREFIX}{v}")).collect())
    }

    fn versions(&self) -> Result<Vec<u32>, GatewayError> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.key_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_FILE_EXTENSION) {
                continue;
            }
            let version = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(MASTER_KEY_PREFIX))
                .and_then(|v| v.parse::<u32>().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.key_dir.join(format!("{key_id}.{KEY_FILE_EXTENSION}"))
    }

    /// Reads a master key; `None` if the file does not exist.
    async fn load_master_key(&self, key_id: &str) -> Result<Option<SecretVec<u8>>, GatewayError> {
        let bytes = match tokio::fs::read(self.key_path(key_id)).await {
            Ok(bytes) => SecretVec::new(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.expose_secret().len() != MASTER_KEY_SIZE {
            return Err(GatewayError::MissingKeyMaterial(format!(
                "master key {key_id} must be {MASTER_KEY_SIZE} bytes"
            )));
        }
        Ok(Some(bytes))
    }
}

#[async_trait]
impl KeyWrappingGateway for FileKeyGateway {
    async fn generate_data_key(
        &self,
        master_key_id: &str,
    ) -> Result<GeneratedDataKey, GatewayError> {
        if !is_valid_key_id(master_key_id) {
            return Err(GatewayError::InvalidKeyId(master_key_id.to_string()));
        }
        let master = self
            .load_master_key(master_key_id)
            .await?
            .ok_or_else(|| GatewayError::InvalidKeyId(master_key_id.to_string()))?;

        let key = DataKey::generate();
        let wrapped_key = wrap(master.expose_secret(), master_key_id, key.expose())?;

        Ok(GeneratedDataKey {
            key,
            wrapped_key,
            key_id: Some(master_key_id.to_string()),
        })
    }

    async fn unwrap_data_key(&self, wrapped_key: &[u8]) -> Result<DataKey, GatewayError> {
        let blob = WrappedBlob::parse(wrapped_key)?;
        let master = self.load_master_key(blob.key_id).await?.ok_or_else(|| {
            GatewayError::KeyUnavailable(format!("master key {} not found", blob.key_id))
        })?;

        let cipher = ChaCha20Poly1305::new_from_slice(master.expose_secret())
            .map_err(|_| GatewayError::MissingKeyMaterial("invalid master key".to_string()))?;
        let raw = cipher
            .decrypt(
                Nonce::from_slice(blob.nonce),
                Payload { msg: blob.ciphertext, aad: blob.key_id.as_bytes() },
            )
            .map_err(|_| GatewayError::InvalidCiphertext("authentication failed".to_string()))?;

        DataKey::from_vec(raw)
    }
}

/// A parsed wrapped key blob.
#[derive(Debug, PartialEq, Eq)]
struct WrappedBlob<'a> {
    key_id: &'a str,
    nonce: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> WrappedBlob<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, GatewayError> {
        let malformed = |msg: &str| GatewayError::InvalidCiphertext(msg.to_string());

        let (&version, rest) = data.split_first().ok_or_else(|| malformed("empty blob"))?;
        if version != BLOB_VERSION {
            return Err(malformed(&format!("unsupported blob version {version}")));
        }

        let (&id_len, rest) = rest.split_first().ok_or_else(|| malformed("missing key id"))?;
        let id_len = usize::from(id_len);
        if rest.len() < id_len + NONCE_SIZE {
            return Err(malformed("blob truncated"));
        }
        let (key_id, rest) = rest.split_at(id_len);
        let key_id = std::str::from_utf8(key_id)
            .ok()
            .filter(|id| is_valid_key_id(id))
            .ok_or_else(|| malformed("invalid key id"))?;

        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        if ciphertext.is_empty() {
            return Err(malformed("blob truncated"));
        }
        Ok(Self { key_id, nonce, ciphertext })
    }
}

fn wrap(master: &[u8], key_id: &str, data_key: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let id_len = u8::try_from(key_id.len())
        .map_err(|_| GatewayError::InvalidKeyId(key_id.to_string()))?;
    let cipher = ChaCha20Poly1305::new_from_slice(master)
        .map_err(|_| GatewayError::MissingKeyMaterial("invalid master key".to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: data_key, aad: key_id.as_bytes() })
        .map_err(|_| GatewayError::Unavailable("data key wrapping failed".to_string()))?;

    let mut blob = Vec::with_capacity(2 + key_id.len() + NONCE_SIZE + ciphertext.len());
    blob.push(BLOB_VERSION);
    blob.push(id_len);
    blob.extend_from_slice(key_id.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn is_valid_key_id(key_id: &str) -> bool {
    !key_id.is_empty()
        && key_id.len() <= usize::from(u8::MAX)
        && key_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn write_key_file(path: &Path, key: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use phivault::envelope::EnvelopeService;
    use phivault::Error;
    use tempfile::TempDir;

    fn gateway() -> (TempDir, FileKeyGateway, String) {
        let dir = TempDir::new().unwrap();
        let master_key_id = FileKeyGateway::init(dir.path()).unwrap();
        let gateway = FileKeyGateway::new(dir.path()).unwrap();
        (dir, gateway, master_key_id)
    }

    #[test]
    fn test_init_creates_first_master_key() {
        let (dir, gateway, master_key_id) = gateway();

        assert_eq!(master_key_id, "master_v1");
        let key = fs::read(dir.path().join("master_v1.key")).unwrap();
        assert_eq!(key.len(), MASTER_KEY_SIZE);
        assert_eq!(gateway.master_key_ids().unwrap(), vec!["master_v1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_master_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, _, _) = gateway();
        let mode = fs::metadata(dir.path().join("master_v1.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_create_master_key_increments_version() {
        let (_dir, gateway, _) = gateway();

        assert_eq!(gateway.create_master_key().unwrap(), "master_v2");
        assert_eq!(gateway.create_master_key().unwrap(), "master_v3");
        assert_eq!(gateway.master_key_ids().unwrap(), vec!["master_v1", "master_v2", "master_v3"]);
    }

    #[test]
    fn test_new_requires_existing_directory() {
        let dir = TempDir::new().unwrap();
        let result = FileKeyGateway::new(dir.path().join("missing"));
        assert!(matches!(result, Err(GatewayError::Io(_))));
    }

    #[tokio::test]
    async fn test_generate_and_unwrap() {
        let (_dir, gateway, master_key_id) = gateway();

        let generated = gateway.generate_data_key(&master_key_id).await.unwrap();
        assert_eq!(generated.key_id.as_deref(), Some("master_v1"));
        assert_eq!(generated.wrapped_key[0], BLOB_VERSION);
        assert_eq!(&generated.wrapped_key[2..11], b"master_v1");

        let unwrapped = gateway.unwrap_data_key(&generated.wrapped_key).await.unwrap();
        assert_eq!(unwrapped.expose(), generated.key.expose());
    }

    #[tokio::test]
    async fn test_unknown_or_invalid_master_key_id() {
        let (_dir, gateway, _) = gateway();

        for id in ["master_v9", "../master_v1", "", "master v1"] {
            let result = gateway.generate_data_key(id).await;
            assert!(matches!(result, Err(GatewayError::InvalidKeyId(_))), "{id:?}");
        }
    }

    #[tokio::test]
    async fn test_tampered_blob_rejected() {
        let (_dir, gateway, master_key_id) = gateway();
        let wrapped = gateway.generate_data_key(&master_key_id).await.unwrap().wrapped_key;

        for i in 0..wrapped.len() {
            let mut tampered = wrapped.clone();
            tampered[i] ^= 0x01;
            let result = gateway.unwrap_data_key(&tampered).await;
            assert!(
                matches!(
                    result,
                    Err(GatewayError::InvalidCiphertext(_) | GatewayError::KeyUnavailable(_))
                ),
                "byte {i}"
            );
        }
    }

    #[tokio::test]
    async fn test_truncated_blob_rejected() {
        let (_dir, gateway, master_key_id) = gateway();
        let wrapped = gateway.generate_data_key(&master_key_id).await.unwrap().wrapped_key;

        for len in [0, 1, 5, 11, 23] {
            let result = gateway.unwrap_data_key(&wrapped[..len]).await;
            assert!(matches!(result, Err(GatewayError::InvalidCiphertext(_))), "len {len}");
        }
    }

    #[tokio::test]
    async fn test_missing_master_key_is_unavailable() {
        let (dir, gateway, master_key_id) = gateway();
        let wrapped = gateway.generate_data_key(&master_key_id).await.unwrap().wrapped_key;

        fs::remove_file(dir.path().join("master_v1.key")).unwrap();

        let result = gateway.unwrap_data_key(&wrapped).await;
        assert!(matches!(result, Err(GatewayError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_old_keys_unwrap_after_rotation() {
        let (_dir, gateway, v1) = gateway();
        let old = gateway.generate_data_key(&v1).await.unwrap();

        let v2 = gateway.create_master_key().unwrap();
        let new = gateway.generate_data_key(&v2).await.unwrap();

        assert_eq!(gateway.unwrap_data_key(&old.wrapped_key).await.unwrap().expose(), old.key.expose());
        assert_eq!(gateway.unwrap_data_key(&new.wrapped_key).await.unwrap().expose(), new.key.expose());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_calls_on_single_threaded_runtime() {
        let (_dir, gateway, master_key_id) = gateway();

        let (a, b, c) = tokio::join!(
            gateway.generate_data_key(&master_key_id),
            gateway.generate_data_key(&master_key_id),
            gateway.generate_data_key(&master_key_id),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_ne!(a.key.expose(), b.key.expose());
        assert_ne!(b.key.expose(), c.key.expose());

        let (ua, uc) = tokio::join!(
            gateway.unwrap_data_key(&a.wrapped_key),
            gateway.unwrap_data_key(&c.wrapped_key),
        );
        assert_eq!(ua.unwrap().expose(), a.key.expose());
        assert_eq!(uc.unwrap().expose(), c.key.expose());
    }

    #[test]
    fn test_blob_parse() {
        let mut data = vec![BLOB_VERSION, 2];
        data.extend_from_slice(b"k1");
        data.extend_from_slice(&[7; NONCE_SIZE]);
        data.extend_from_slice(&[9; 4]);

        let blob = WrappedBlob::parse(&data).unwrap();
        assert_eq!(blob, WrappedBlob { key_id: "k1", nonce: &[7; NONCE_SIZE], ciphertext: &[9; 4] });

        data[0] = 99;
        assert!(matches!(WrappedBlob::parse(&data), Err(GatewayError::InvalidCiphertext(_))));
    }

    #[tokio::test]
    async fn test_envelope_service_with_file_gateway() {
        let (_dir, gateway, master_key_id) = gateway();
        let service = EnvelopeService::new(gateway, master_key_id);

        let sealed = service.seal("MRN-00412").await.unwrap();
        assert_eq!(sealed.master_key_id, "master_v1");
        assert_eq!(service.open_field(&sealed).await.unwrap(), "MRN-00412");
    }

    #[tokio::test]
    async fn test_envelope_service_reports_revoked_master_as_integrity() {
        let (dir, gateway, master_key_id) = gateway();
        let service = EnvelopeService::new(gateway, master_key_id);
        let sealed = service.seal("MRN-00412").await.unwrap();

        fs::remove_file(dir.path().join("master_v1.key")).unwrap();

        let result = service.open_field(&sealed).await;
        assert!(matches!(result, Err(Error::Integrity(_))));
    }
}
