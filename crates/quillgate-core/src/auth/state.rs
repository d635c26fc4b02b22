use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::token::Claims;

/// Authentication state owned by the session manager.
///
/// Identity lives inside the `Authenticated` variant, so a snapshot can never
/// pair `is_authenticated = true` with a missing identity.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Uninitialized,
    Unauthenticated,
    Authenticated(Claims),
}

impl AuthState {
    pub fn status(&self) -> AuthStatus {
        match self {
            AuthState::Uninitialized => AuthStatus::Uninitialized,
            AuthState::Unauthenticated => AuthStatus::Unauthenticated,
            AuthState::Authenticated(_) => AuthStatus::Authenticated,
        }
    }

    pub fn identity(&self) -> Option<&Claims> {
        match self {
            AuthState::Authenticated(claims) => Some(claims),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Uninitialized,
    Unauthenticated,
    Authenticated,
}

/// Why the session last fell back to logged-out, for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    /// Server refused to renew; the user must log in again
    SessionExpired,
    /// Server could not be reached
    Offline,
    TimedOut,
    /// Server issued a token that could not be used
    InvalidToken,
    /// Token could not be persisted
    StorageUnavailable,
}

impl FailureReason {
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureReason::SessionExpired => "Your session has expired. Please log in again.",
            FailureReason::Offline => {
                "Unable to connect to server. Check your internet connection."
            }
            FailureReason::TimedOut => "Connection timed out. Please try again.",
            FailureReason::InvalidToken => "The server returned an invalid session. Please log in again.",
            FailureReason::StorageUnavailable => "Unable to save your session on this device.",
        }
    }
}

/// Point-in-time view of the session handed to readers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: AuthStatus,
    pub is_authenticated: bool,
    pub identity: Option<Claims>,
    pub last_failure: Option<FailureReason>,
    /// Incremented on every applied transition
    pub revision: u64,
}

impl SessionSnapshot {
    pub fn new(state: &AuthState, last_failure: Option<FailureReason>, revision: u64) -> Self {
        let identity = state.identity().cloned();
        Self {
            status: state.status(),
            is_authenticated: identity.is_some(),
            identity,
            last_failure,
            revision,
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|c| c.subject.as_deref())
    }
}

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Useful in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
