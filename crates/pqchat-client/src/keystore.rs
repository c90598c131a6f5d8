//! Local custody of KEM secret keys
//!
//! The secret key never leaves this machine except through an explicit
//! export. It is created by [`KeyStore::generate`], [`KeyStore::commit`] or
//! [`KeyStore::import`],
//! handed out by [`KeyStore::unlock`] for the duration of a session, and
//! destroyed by [`KeyStore::wipe`] on logout.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use pqchat_crypto::{CryptoError, HybridCipher, Identity, KeyPair, PublicKey, SecretKey};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no secret key stored for {0}")]
    MissingSecretKey(Identity),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key data: {0}")]
    InvalidKeyData(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// Secret key persistence backend.
pub trait SecretStorage: Send + Sync {
    fn put(&self, identity: &Identity, secret: &SecretKey) -> Result<(), KeyStoreError>;
    fn get(&self, identity: &Identity) -> Result<Option<SecretKey>, KeyStoreError>;
    /// Returns whether a key was present.
    fn remove(&self, identity: &Identity) -> Result<bool, KeyStoreError>;
    fn contains(&self, identity: &Identity) -> bool;
}

/// Write `contents` to `path` through a temp file, readable by the owner only.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

// ============================================================================
// File storage
// ============================================================================

/// One file per identity under a private directory.
///
/// File names are the SHA-256 of the identity so arbitrary identity strings
/// never become path components.
pub struct FileSecretStorage {
    dir: PathBuf,
}

impl FileSecretStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Platform data directory, e.g. `~/.local/share/pqchat/keys`.
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "pqchat", "pqchat").map(|dirs| dirs.data_dir().join("keys"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, identity: &Identity) -> PathBuf {
        let digest = Sha256::digest(identity.as_str().as_bytes());
        self.dir.join(format!("{}.key", hex::encode(digest)))
    }
}

impl SecretStorage for FileSecretStorage {
    fn put(&self, identity: &Identity, secret: &SecretKey) -> Result<(), KeyStoreError> {
        let path = self.path_for(identity);
        write_private(&path, secret.to_base64().as_bytes())?;
        debug!(%identity, path = %path.display(), "secret key written");
        Ok(())
    }

    fn get(&self, identity: &Identity) -> Result<Option<SecretKey>, KeyStoreError> {
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(None);
        }
        let contents = Zeroizing::new(fs::read_to_string(&path)?);
        let secret = SecretKey::from_base64(&contents)
            .map_err(|e| KeyStoreError::InvalidKeyData(format!("{}: {}", path.display(), e)))?;
        Ok(Some(secret))
    }

    fn remove(&self, identity: &Identity) -> Result<bool, KeyStoreError> {
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    fn contains(&self, identity: &Identity) -> bool {
        self.path_for(identity).exists()
    }
}

// ============================================================================
// Memory storage
// ============================================================================

/// Process-local storage, gone when the process exits.
#[derive(Default)]
pub struct MemorySecretStorage {
    keys: Mutex<HashMap<Identity, Zeroizing<Vec<u8>>>>,
}

impl MemorySecretStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Identity, Zeroizing<Vec<u8>>>>, KeyStoreError> {
        self.keys
            .lock()
            .map_err(|_| KeyStoreError::Unavailable("memory storage lock poisoned".to_string()))
    }
}

impl SecretStorage for MemorySecretStorage {
    fn put(&self, identity: &Identity, secret: &SecretKey) -> Result<(), KeyStoreError> {
        self.lock()?
            .insert(identity.clone(), Zeroizing::new(secret.expose_secret().to_vec()));
        Ok(())
    }

    fn get(&self, identity: &Identity) -> Result<Option<SecretKey>, KeyStoreError> {
        Ok(self
            .lock()?
            .get(identity)
            .map(|bytes| SecretKey::from_bytes(bytes.to_vec())))
    }

    fn remove(&self, identity: &Identity) -> Result<bool, KeyStoreError> {
        Ok(self.lock()?.remove(identity).is_some())
    }

    fn contains(&self, identity: &Identity) -> bool {
        self.lock().map(|keys| keys.contains_key(identity)).unwrap_or(false)
    }
}

// ============================================================================
// KeyStore
// ============================================================================

/// A downloadable copy of a secret key.
pub struct KeyExport {
    pub file_name: String,
    pub body: Zeroizing<String>,
}

impl fmt::Debug for KeyExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExport")
            .field("file_name", &self.file_name)
            .field("body", &"[REDACTED]")
            .finish()
    }
}

/// Identity rendered for use in a file name. Path separators and other
/// unusual characters become `_`.
fn file_safe(identity: &str) -> String {
    identity
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') { c } else { '_' })
        .collect::<String>()
        .replace("..", "__")
}

/// A freshly generated key pair that is not stored yet.
///
/// Dropping it discards the secret half and leaves the store unchanged.
pub struct PendingKey {
    identity: Identity,
    pair: KeyPair,
}

impl PendingKey {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pair.public_key
    }
}

impl fmt::Debug for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingKey")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

pub struct KeyStore {
    storage: Box<dyn SecretStorage>,
    cipher: HybridCipher,
}

impl KeyStore {
    pub fn new(storage: impl SecretStorage + 'static, cipher: HybridCipher) -> Self {
        Self {
            storage: Box::new(storage),
            cipher,
        }
    }

    /// Store kept in memory only.
    pub fn ephemeral(cipher: HybridCipher) -> Self {
        Self::new(MemorySecretStorage::new(), cipher)
    }

    pub fn cipher(&self) -> &HybridCipher {
        &self.cipher
    }

    /// Generate a fresh key pair for `identity`, keeping the secret half.
    ///
    /// Replaces any key already stored for the identity.
    pub fn generate(&self, identity: &Identity) -> Result<PublicKey, KeyStoreError> {
        let pending = self.prepare(identity)?;
        self.commit(pending)
    }

    /// Generate a key pair for `identity` without storing it.
    pub fn prepare(&self, identity: &Identity) -> Result<PendingKey, KeyStoreError> {
        let pair = self.cipher.kem().generate_keypair()?;
        debug!(%identity, kem = self.cipher.kem().algorithm(), "generated pending key pair");
        Ok(PendingKey {
            identity: identity.clone(),
            pair,
        })
    }

    /// Store the secret half of a pending key, replacing any key already
    /// held for its identity.
    pub fn commit(&self, pending: PendingKey) -> Result<PublicKey, KeyStoreError> {
        let PendingKey { identity, pair } = pending;
        self.storage.put(&identity, &pair.secret_key)?;
        info!(%identity, kem = self.cipher.kem().algorithm(), "stored key pair");
        Ok(pair.public_key)
    }

    /// Public half of the stored key, derived from the secret.
    pub fn public_key(&self, identity: &Identity) -> Result<PublicKey, KeyStoreError> {
        let secret = self.unlock(identity)?;
        Ok(self.cipher.kem().public_key_from_secret(&secret)?)
    }

    pub fn export(&self, identity: &Identity) -> Result<KeyExport, KeyStoreError> {
        let secret = self.unlock(identity)?;
        Ok(KeyExport {
            file_name: format!("{}_private_key.txt", file_safe(identity.as_str())),
            body: secret.to_base64(),
        })
    }

    /// Write the export artifact into `dir`, returning its path.
    pub fn export_to_file(&self, identity: &Identity, dir: &Path) -> Result<PathBuf, KeyStoreError> {
        let export = self.export(identity)?;
        let path = dir.join(&export.file_name);
        write_private(&path, export.body.as_bytes())?;
        info!(%identity, path = %path.display(), "exported secret key");
        Ok(path)
    }

    /// Store a previously exported key for `identity`.
    pub fn import(&self, identity: &Identity, artifact: &str) -> Result<(), KeyStoreError> {
        let secret = SecretKey::from_base64(artifact)?;
        let expected = self.cipher.kem().secret_key_len();
        if secret.len() != expected {
            return Err(CryptoError::KeyFormat {
                what: "secret key",
                expected,
                got: secret.len(),
            }
            .into());
        }
        self.storage.put(identity, &secret)?;
        info!(%identity, "imported secret key");
        Ok(())
    }

    /// Hand out the secret key for a session.
    pub fn unlock(&self, identity: &Identity) -> Result<SecretKey, KeyStoreError> {
        self.storage
            .get(identity)?
            .ok_or_else(|| KeyStoreError::MissingSecretKey(identity.clone()))
    }

    /// Destroy the stored key. Returns whether one existed.
    pub fn wipe(&self, identity: &Identity) -> Result<bool, KeyStoreError> {
        let removed = self.storage.remove(identity)?;
        if removed {
            info!(%identity, "secret key wiped");
        }
        Ok(removed)
    }

    pub fn has_key(&self, identity: &Identity) -> bool {
        self.storage.contains(identity)
    }
}
