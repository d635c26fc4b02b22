//! Authentication module for managing the client-side session.
//!
//! This module provides:
//! - `CredentialStore`: single-slot token persistence (keychain, file,
//!   encrypted file, memory)
//! - `token`: unverified decoding of access token claims
//! - `SessionManager`: the session state machine with refresh coordination
//!   and change notification

pub mod credentials;
pub mod file_store;
pub mod session;
pub mod state;
pub mod token;

pub use credentials::{CredentialStore, KeyringStore, MemoryStore, StoreError, TOKEN_SLOT};
pub use file_store::{EncryptedFileStore, FileStore};
pub use session::{RefreshOutcome, SessionError, SessionManager, SubscriptionId};
pub use state::{
    AuthState, AuthStatus, Clock, FailureReason, ManualClock, SessionSnapshot, SystemClock,
};
pub use token::{Claims, TokenError};
