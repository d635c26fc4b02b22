//! Client-side session lifecycle for quillgate.
//!
//! Keeps a short-lived bearer token, notices when it has expired, renews it
//! through the server's refresh endpoint and tells the rest of the
//! application whenever the authentication state changes.
//!
//! ```rust,ignore
//! let config = Config::load()?.with_env_overrides();
//! let session = SessionManager::new(config.credential_store()?, config.refresh_gateway()?)
//!     .with_refresh_timeout(config.refresh_timeout());
//! session.subscribe(|s| println!("authenticated: {}", s.is_authenticated));
//! session.initialize().await;
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{HttpRefreshGateway, RefreshError, RefreshGateway};
pub use auth::{
    AuthStatus, Claims, CredentialStore, FailureReason, RefreshOutcome, SessionError,
    SessionManager, SessionSnapshot, StoreError, TokenError,
};
pub use config::{Config, StoreBackend};
