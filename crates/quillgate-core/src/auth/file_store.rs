//! File-backed credential stores.
//!
//! `FileStore` keeps the token as plain JSON in the cache directory.
//! `EncryptedFileStore` seals it with XChaCha20-Poly1305 under a key derived
//! from a passphrase with Argon2id, for machines without a usable keychain.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::credentials::{CredentialStore, StoreError};

/// Token file name in cache directory
const TOKEN_FILE: &str = "access_token.json";

/// Sealed token file name in cache directory
const SEALED_TOKEN_FILE: &str = "access_token.sealed.json";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedToken {
    salt: String,
    nonce: String,
    ciphertext: String,
    stored_at: DateTime<Utc>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Failed to read token file");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Failed to parse token file");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Unavailable(format!("Failed to serialize token: {}", e)))?;
    write_private(path, contents.as_bytes())?;
    Ok(())
}

/// Write `contents` to a file only the owner can read.
///
/// The file is created with mode 0600, and a pre-existing file is narrowed
/// to 0600 after truncation and before any bytes are written.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

fn remove_file(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Plain file
// ============================================================================

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(TOKEN_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get(&self) -> Option<String> {
        read_json::<StoredToken>(&self.path).map(|stored| stored.token)
    }

    fn set(&self, token: &str) -> Result<(), StoreError> {
        let stored = StoredToken {
            token: token.to_string(),
            stored_at: Utc::now(),
        };
        write_json(&self.path, &stored)?;
        debug!(path = %self.path.display(), "Token written");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        remove_file(&self.path)
    }
}

// ============================================================================
// Encrypted file
// ============================================================================

pub struct EncryptedFileStore {
    path: PathBuf,
    passphrase: String,
}

impl EncryptedFileStore {
    pub fn new(cache_dir: impl AsRef<Path>, passphrase: impl Into<String>) -> Self {
        Self {
            path: cache_dir.as_ref().join(SEALED_TOKEN_FILE),
            passphrase: passphrase.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self, salt: &[u8]) -> Result<XChaCha20Poly1305, StoreError> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::Unavailable(format!("Key derivation failed: {}", e)))?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(&key)))
    }

    fn seal(&self, token: &str) -> Result<SealedToken, StoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher(&salt)?
            .encrypt(XNonce::from_slice(&nonce), token.as_bytes())
            .map_err(|_| StoreError::Unavailable("Encryption failed".to_string()))?;

        Ok(SealedToken {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            stored_at: Utc::now(),
        })
    }

    fn open(&self, sealed: &SealedToken) -> Result<String, StoreError> {
        let decode = |field: &str| {
            STANDARD
                .decode(field)
                .map_err(|e| StoreError::Unavailable(format!("Corrupt sealed token: {}", e)))
        };
        let salt = decode(&sealed.salt)?;
        let nonce = decode(&sealed.nonce)?;
        let ciphertext = decode(&sealed.ciphertext)?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Unavailable("Corrupt sealed token: bad nonce".to_string()));
        }

        let plaintext = self
            .cipher(&salt)?
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| {
                StoreError::Unavailable("Decryption failed (wrong passphrase or tampered file)".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| StoreError::Unavailable("Sealed token is not UTF-8".to_string()))
    }
}

impl CredentialStore for EncryptedFileStore {
    fn get(&self) -> Option<String> {
        let sealed = read_json::<SealedToken>(&self.path)?;
        match self.open(&sealed) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Failed to open sealed token, treating as no token");
                None
            }
        }
    }

    fn set(&self, token: &str) -> Result<(), StoreError> {
        let sealed = self.seal(token)?;
        write_json(&self.path, &sealed)?;
        debug!(path = %self.path.display(), "Sealed token written");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        remove_file(&self.path)
    }
}

// ============================================================================
// Tests
// ============================================================================
