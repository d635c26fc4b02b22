use keyring::Entry;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed slot name the access token is stored under
pub const TOKEN_SLOT: &str = "accessToken";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),

    #[error("Credential store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-slot persistence for the current access token.
///
/// `get` never fails: a medium that cannot be read reports no token, so
/// session bootstrap cannot crash the application. Write failures are
/// returned because a token that silently failed to persist would leave the
/// session claiming an authentication nothing backs.
pub trait CredentialStore: Send + Sync {
    /// Return the last stored token, if any
    fn get(&self) -> Option<String>;

    /// Persist `token`, replacing any prior value
    fn set(&self, token: &str) -> Result<(), StoreError>;

    /// Remove the stored token. Removing an absent token succeeds.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Token stored in the OS keychain
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(&self.service, TOKEN_SLOT)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create keyring entry: {}", e)))
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self) -> Option<String> {
        let entry = match self.entry() {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Keychain unavailable, treating as no token");
                return None;
            }
        };
        match entry.get_password() {
            Ok(token) => Some(token),
            Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, "No token in keychain");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to read token from keychain");
                None
            }
        }
    }

    fn set(&self, token: &str) -> Result<(), StoreError> {
        self.entry()?
            .set_password(token)
            .map_err(|e| StoreError::Unavailable(format!("Failed to store token in keychain: {}", e)))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Unavailable(format!(
                "Failed to delete token from keychain: {}",
                e
            ))),
        }
    }
}

/// Token held in process memory only; lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(token.into())),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    fn set(&self, token: &str) -> Result<(), StoreError> {
        *self.slot.lock() = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.slot.lock().take();
        Ok(())
    }
}
