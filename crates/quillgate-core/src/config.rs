//! Application configuration management.
//!
//! This module handles loading the configuration, which names the API
//! server, the refresh endpoint, timing knobs and the credential store
//! backend.
//!
//! Configuration is stored at `~/.config/quillgate/config.json`. Environment
//! variables override individual fields.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::{forget_cookies, HttpRefreshGateway, RefreshGateway};
use crate::auth::session::{DEFAULT_REFRESH_BUFFER_SECS, DEFAULT_REFRESH_TIMEOUT};
use crate::auth::{
    CredentialStore, EncryptedFileStore, FileStore, KeyringStore, MemoryStore, SessionManager,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "quillgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Renewal cookie file name in cache directory
const COOKIE_FILE: &str = "refresh_cookies";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";

const ENV_API_URL: &str = "QUILLGATE_API_URL";
const ENV_STORE: &str = "QUILLGATE_STORE";
const ENV_PASSPHRASE: &str = "QUILLGATE_PASSPHRASE";
const ENV_CACHE_DIR: &str = "QUILLGATE_CACHE_DIR";
const ENV_REFRESH_COOKIE: &str = "QUILLGATE_REFRESH_COOKIE";

/// Where the access token is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Keyring,
    File,
    Encrypted,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" | "keychain" => Ok(StoreBackend::Keyring),
            "file" => Ok(StoreBackend::File),
            "encrypted" => Ok(StoreBackend::Encrypted),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown credential store backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub refresh_path: Option<String>,
    pub refresh_timeout_secs: Option<u64>,
    pub refresh_buffer_secs: Option<i64>,
    pub store: StoreBackend,
    pub keyring_service: Option<String>,
    pub cache_dir: Option<PathBuf>,
    /// Encrypted store passphrase; only ever taken from the environment
    #[serde(skip)]
    pub passphrase: Option<String>,
    /// Renewal cookie (`name=value`) to seed the refresh client with;
    /// only ever taken from the environment
    #[serde(skip)]
    pub refresh_cookie: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `QUILLGATE_*` environment variables on top of the file values
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = Some(url);
        }
        if let Some(store) = lookup(ENV_STORE) {
            match store.parse() {
                Ok(backend) => self.store = backend,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORE),
            }
        }
        if let Some(passphrase) = lookup(ENV_PASSPHRASE) {
            self.passphrase = Some(passphrase);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(cookie) = lookup(ENV_REFRESH_COOKIE) {
            self.refresh_cookie = Some(cookie);
        }
        self
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn refresh_path(&self) -> &str {
        self.refresh_path.as_deref().unwrap_or(DEFAULT_REFRESH_PATH)
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_buffer_secs.unwrap_or(DEFAULT_REFRESH_BUFFER_SECS))
    }

    pub fn keyring_service(&self) -> &str {
        self.keyring_service.as_deref().unwrap_or(APP_NAME)
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Build the configured credential store
    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        let store: Arc<dyn CredentialStore> = match self.store {
            StoreBackend::Keyring => Arc::new(KeyringStore::new(self.keyring_service())),
            StoreBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            StoreBackend::Encrypted => {
                let passphrase = self.passphrase.clone().ok_or_else(|| {
                    anyhow::anyhow!("{} must be set for the encrypted store", ENV_PASSPHRASE)
                })?;
                Arc::new(EncryptedFileStore::new(self.cache_dir()?, passphrase))
            }
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }

    /// Where the renewal cookie jar is kept between runs
    pub fn cookie_path(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join(COOKIE_FILE))
    }

    /// Build the HTTP refresh gateway.
    ///
    /// Except with the memory store, the cookie jar is persisted next to the
    /// file stores so a renewal cookie outlives the process.
    pub fn refresh_gateway(&self) -> Result<Arc<dyn RefreshGateway>> {
        let cookie_file = match self.store {
            StoreBackend::Memory => None,
            _ => Some(self.cookie_path()?),
        };
        let gateway = HttpRefreshGateway::with_cookies(
            self.api_base_url(),
            self.refresh_path(),
            cookie_file,
            self.refresh_cookie.as_deref(),
        )
        .context("Failed to build refresh client")?;
        Ok(Arc::new(gateway))
    }

    /// Drop the persisted renewal cookie, so a logged-out session is not
    /// silently renewed on the next start.
    pub fn forget_refresh_cookie(&self) -> Result<()> {
        let path = self.cookie_path()?;
        forget_cookies(&path)
            .with_context(|| format!("Failed to remove cookie file {}", path.display()))
    }

    /// Session manager wired with the configured store, gateway and timings
    pub fn session_manager(&self) -> Result<SessionManager> {
        Ok(
            SessionManager::new(self.credential_store()?, self.refresh_gateway()?)
                .with_refresh_timeout(self.refresh_timeout())
                .with_refresh_buffer(self.refresh_buffer()),
        )
    }
}
