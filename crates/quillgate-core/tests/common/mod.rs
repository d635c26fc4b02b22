#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use quillgate_core::auth::ManualClock;
use quillgate_core::{RefreshError, RefreshGateway};
use tokio::sync::oneshot;

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

/// Unsigned JWT-shaped token for `sub` expiring at `exp`
pub fn mint(sub: &str, exp: DateTime<Utc>) -> String {
    let payload = serde_json::json!({
        "sub": sub,
        "iat": (exp - Duration::minutes(15)).timestamp(),
        "exp": exp.timestamp(),
        "role": "author",
    });
    format!(
        "{}.{}.unsigned",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

pub fn valid(sub: &str) -> String {
    mint(sub, epoch() + Duration::minutes(15))
}

pub fn expired(sub: &str) -> String {
    mint(sub, epoch() - Duration::minutes(1))
}

pub fn rejected() -> RefreshError {
    RefreshError::Rejected {
        status: 401,
        message: "refresh cookie expired".to_string(),
    }
}

// ============================================================================
// Gateways
// ============================================================================

/// Answers each call with the next queued reply
#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<Result<String, RefreshError>>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(replies: Vec<Result<String, RefreshError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshGateway for ScriptedGateway {
    fn refresh(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshError::Transport("no reply scripted".to_string())));
        Box::pin(async move { reply })
    }
}

/// Parks the first call until the test releases it
pub struct ParkedGateway {
    started: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<Result<String, RefreshError>>>>,
    calls: AtomicUsize,
}

pub struct ParkedHandles {
    pub started: oneshot::Receiver<()>,
    pub release: oneshot::Sender<Result<String, RefreshError>>,
}

impl ParkedGateway {
    pub fn new() -> (Arc<Self>, ParkedHandles) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let gateway = Arc::new(Self {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(Some(release_rx)),
            calls: AtomicUsize::new(0),
        });
        (
            gateway,
            ParkedHandles {
                started: started_rx,
                release: release_tx,
            },
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshGateway for ParkedGateway {
    fn refresh(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = self.started.lock().unwrap().take();
        let release = self.release.lock().unwrap().take();
        Box::pin(async move {
            if let Some(started) = started {
                let _ = started.send(());
            }
            match release {
                Some(release) => release
                    .await
                    .unwrap_or_else(|_| Err(RefreshError::Transport("released without reply".to_string()))),
                None => Err(RefreshError::Transport("parked gateway already used".to_string())),
            }
        })
    }
}

/// Never answers
pub struct SilentGateway;

impl RefreshGateway for SilentGateway {
    fn refresh(&self) -> BoxFuture<'_, Result<String, RefreshError>> {
        Box::pin(futures::future::pending())
    }
}
