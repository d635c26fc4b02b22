//! Session manager: owns the authentication state, decides when the stored
//! token is usable, coordinates refreshes and broadcasts every transition.
//!
//! All transitions are serialized by a writer lock and bump a revision
//! counter. A refresh remembers the revision it started from; when its round
//! trip completes under a newer revision (a login or logout landed meanwhile)
//! the result is discarded, success or failure alike.
//!
//! Credential store writes happen under the writer lock only. The state lock
//! is taken just long enough to swap the state, so readers never wait on a
//! slow store (key derivation in `EncryptedFileStore`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialStore, StoreError};
use super::state::{AuthState, AuthStatus, Clock, FailureReason, SessionSnapshot, SystemClock};
use super::token::{self, Claims, TokenError};
use crate::api::{RefreshError, RefreshGateway};

/// Default bound on a single refresh round trip
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window before expiry in which `ensure_fresh` renews the token
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Login token rejected: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Login token expired at {0}")]
    ExpiredToken(DateTime<Utc>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// A new token was stored and the session is authenticated with it
    Renewed(SessionSnapshot),
    /// A login, logout or other refresh landed first; nothing was applied
    Superseded(SessionSnapshot),
}

impl RefreshOutcome {
    pub fn snapshot(&self) -> &SessionSnapshot {
        match self {
            RefreshOutcome::Renewed(s) | RefreshOutcome::Superseded(s) => s,
        }
    }

    pub fn into_snapshot(self) -> SessionSnapshot {
        match self {
            RefreshOutcome::Renewed(s) | RefreshOutcome::Superseded(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Inner {
    state: AuthState,
    last_failure: Option<FailureReason>,
    revision: u64,
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(&self.state, self.last_failure, self.revision)
    }
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    gateway: Arc<dyn RefreshGateway>,
    clock: Arc<dyn Clock>,
    refresh_timeout: Duration,
    refresh_buffer: chrono::Duration,
    inner: Mutex<Inner>,
    /// Held from a transition's store write through its commit
    write_lock: Mutex<()>,
    /// Held across the gateway round trip so refreshes never overlap
    refresh_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    changes: watch::Sender<SessionSnapshot>,
    /// Set once startup settles; a cancelled startup leaves it unset
    started: OnceCell<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, gateway: Arc<dyn RefreshGateway>) -> Self {
        let inner = Inner {
            state: AuthState::Uninitialized,
            last_failure: None,
            revision: 0,
        };
        let (changes, _) = watch::channel(inner.snapshot());

        Self {
            store,
            gateway,
            clock: Arc::new(SystemClock),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            refresh_buffer: chrono::Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS),
            inner: Mutex::new(inner),
            write_lock: Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            changes,
            started: OnceCell::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_refresh_buffer(mut self, buffer: chrono::Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    // ===== Reads =====

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.lock().state.status()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.inner.lock().state, AuthState::Authenticated(_))
    }

    pub fn identity(&self) -> Option<Claims> {
        self.inner.lock().state.identity().cloned()
    }

    pub fn last_failure(&self) -> Option<FailureReason> {
        self.inner.lock().last_failure
    }

    /// The stored token to attach as a bearer credential, while authenticated
    pub fn access_token(&self) -> Option<String> {
        if self.is_authenticated() {
            self.store.get()
        } else {
            None
        }
    }

    // ===== Subscriptions =====

    /// Register a callback run after every transition with the new snapshot.
    ///
    /// Callbacks run on the thread that applied the transition, after the
    /// state lock is released and before the operation returns.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Receiver that always holds the latest snapshot, for async consumers
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.changes.subscribe()
    }

    // ===== Transitions =====

    /// Settle into `Authenticated` or `Unauthenticated` from whatever the
    /// credential store holds.
    ///
    /// Startup runs once. Concurrent callers wait for it to settle; if the
    /// running call is dropped midway, the next caller starts over.
    pub async fn initialize(&self) -> SessionSnapshot {
        self.started.get_or_init(|| self.start()).await;
        self.snapshot()
    }

    async fn start(&self) {
        let revision = {
            let inner = self.inner.lock();
            if !matches!(inner.state, AuthState::Uninitialized) {
                debug!(status = ?inner.state.status(), "Session settled before initialize");
                return;
            }
            inner.revision
        };

        match self.store.get() {
            Some(stored) => match token::decode(&stored) {
                Ok(claims) if !claims.is_expired(self.clock.now()) => {
                    let writing = self.write_lock.lock();
                    let mut inner = self.inner.lock();
                    if inner.revision != revision {
                        return;
                    }
                    info!(subject = ?claims.subject, expires_at = %claims.expires_at, "Restored session from stored token");
                    let snapshot = self.commit(&mut inner, AuthState::Authenticated(claims), None);
                    drop(inner);
                    drop(writing);
                    self.notify(&snapshot);
                    return;
                }
                Ok(claims) => {
                    info!(expired_at = %claims.expires_at, "Stored token expired, refreshing");
                }
                Err(e) => {
                    warn!(error = %e, "Stored token unreadable, refreshing");
                }
            },
            None => debug!("No stored token, attempting silent refresh"),
        }

        if let Err(e) = self.refresh_from(revision).await {
            info!(error = %e, "Silent refresh failed");
        }
    }

    /// Adopt a freshly issued token. Always wins over the prior state and
    /// over any refresh still in flight.
    ///
    /// The token is validated before the store is touched; on any error the
    /// session is left as it was.
    pub fn login(&self, token: &str) -> Result<SessionSnapshot, SessionError> {
        let claims = token::decode(token)?;
        if claims.is_expired(self.clock.now()) {
            return Err(SessionError::ExpiredToken(claims.expires_at));
        }

        let writing = self.write_lock.lock();
        self.store.set(token)?;
        info!(subject = ?claims.subject, expires_at = %claims.expires_at, "Logged in");
        let snapshot = self.commit(&mut self.inner.lock(), AuthState::Authenticated(claims), None);
        drop(writing);

        self.notify(&snapshot);
        Ok(snapshot)
    }

    /// Exchange the renewal credential for a new access token.
    ///
    /// Any failure logs the session out before the error is returned.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let revision = self.inner.lock().revision;
        self.refresh_from(revision).await
    }

    /// Renew the token if it is within the refresh buffer of expiring.
    ///
    /// A logged-out session stays logged out; only `initialize` and an
    /// explicit `refresh` attempt silent re-authentication.
    pub async fn ensure_fresh(&self) -> Result<SessionSnapshot, RefreshError> {
        let due = match &self.inner.lock().state {
            AuthState::Uninitialized => None,
            AuthState::Unauthenticated => Some(false),
            AuthState::Authenticated(claims) => {
                Some(claims.needs_refresh(self.clock.now(), self.refresh_buffer))
            }
        };

        match due {
            None => Ok(self.initialize().await),
            Some(true) => {
                debug!("Token near expiry, refreshing proactively");
                self.refresh().await.map(RefreshOutcome::into_snapshot)
            }
            Some(false) => Ok(self.snapshot()),
        }
    }

    /// Clear the stored token and drop to `Unauthenticated`. Idempotent.
    ///
    /// The transition happens even if the store cannot be cleared; that
    /// failure is returned afterwards.
    pub fn logout(&self) -> Result<SessionSnapshot, StoreError> {
        let writing = self.write_lock.lock();
        let (snapshot, cleared) = self.sign_out(None);
        drop(writing);

        info!("Logged out");
        self.notify(&snapshot);
        cleared.map(|()| snapshot)
    }

    async fn refresh_from(&self, revision: u64) -> Result<RefreshOutcome, RefreshError> {
        let _in_flight = self.refresh_lock.lock().await;
        if self.inner.lock().revision != revision {
            debug!("Session changed while waiting on an in-flight refresh");
            return Ok(RefreshOutcome::Superseded(self.snapshot()));
        }

        let fetched = match tokio::time::timeout(self.refresh_timeout, self.gateway.refresh()).await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Timeout(self.refresh_timeout)),
        };
        let renewed = fetched.and_then(|token| {
            let claims = token::decode(&token)?;
            if claims.is_expired(self.clock.now()) {
                return Err(RefreshError::ExpiredToken);
            }
            Ok((token, claims))
        });

        let writing = self.write_lock.lock();
        {
            let inner = self.inner.lock();
            if inner.revision != revision {
                info!(succeeded = renewed.is_ok(), "Discarding refresh result superseded by a newer transition");
                return Ok(RefreshOutcome::Superseded(inner.snapshot()));
            }
        }

        let failure = match renewed {
            Ok((token, claims)) => match self.store.set(&token) {
                Ok(()) => {
                    info!(subject = ?claims.subject, expires_at = %claims.expires_at, "Session refreshed");
                    let snapshot =
                        self.commit(&mut self.inner.lock(), AuthState::Authenticated(claims), None);
                    drop(writing);
                    self.notify(&snapshot);
                    return Ok(RefreshOutcome::Renewed(snapshot));
                }
                Err(e) => RefreshError::Store(e),
            },
            Err(e) => e,
        };

        warn!(error = %failure, transport = failure.is_transport(), "Refresh failed, logging out");
        let (snapshot, cleared) = self.sign_out(Some(failure.reason()));
        drop(writing);
        self.notify(&snapshot);

        match cleared {
            Ok(()) => Err(failure),
            // The stale token is still stored; that outranks the refresh error
            Err(e) => Err(RefreshError::Store(e)),
        }
    }

    /// Clear the store and commit `Unauthenticated`. A clear failure is
    /// recorded as `StorageUnavailable`. Caller holds the writer lock.
    fn sign_out(&self, failure: Option<FailureReason>) -> (SessionSnapshot, Result<(), StoreError>) {
        let cleared = self.store.clear();
        let failure = match cleared {
            Ok(()) => failure,
            Err(ref e) => {
                error!(error = %e, "Failed to clear stored token");
                Some(FailureReason::StorageUnavailable)
            }
        };
        let snapshot = self.commit(&mut self.inner.lock(), AuthState::Unauthenticated, failure);
        (snapshot, cleared)
    }

    fn commit(
        &self,
        inner: &mut Inner,
        state: AuthState,
        failure: Option<FailureReason>,
    ) -> SessionSnapshot {
        inner.state = state;
        inner.last_failure = failure;
        inner.revision += 1;
        let snapshot = inner.snapshot();
        self.changes.send_replace(snapshot.clone());
        snapshot
    }

    fn notify(&self, snapshot: &SessionSnapshot) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(snapshot);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
