mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use quillgate_core::auth::{Clock, MemoryStore};
use quillgate_core::{
    AuthStatus, CredentialStore, FailureReason, RefreshError, RefreshGateway, RefreshOutcome,
    SessionManager, SessionSnapshot,
};

use common::*;

fn session(store: &Arc<MemoryStore>, gateway: Arc<dyn RefreshGateway>) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(store.clone(), gateway).with_clock(clock()))
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_no_stored_token_refresh_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let token = valid("alice");
    let gateway = ScriptedGateway::new(vec![Ok(token.clone())]);
    let session = session(&store, gateway.clone());

    let snapshot = session.initialize().await;

    assert_eq!(snapshot.status, AuthStatus::Authenticated);
    assert!(snapshot.is_authenticated);
    assert_eq!(snapshot.subject(), Some("alice"));
    assert_eq!(store.get(), Some(token));
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn test_expired_token_and_rejected_refresh_logs_out() {
    let store = Arc::new(MemoryStore::with_token(expired("alice")));
    let gateway = ScriptedGateway::new(vec![Err(rejected())]);
    let session = session(&store, gateway.clone());

    let snapshot = session.initialize().await;

    assert_eq!(snapshot.status, AuthStatus::Unauthenticated);
    assert!(snapshot.identity.is_none());
    assert_eq!(snapshot.last_failure, Some(FailureReason::SessionExpired));
    assert_eq!(store.get(), None);
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn test_valid_stored_token_skips_gateway() {
    let token = valid("alice");
    let store = Arc::new(MemoryStore::with_token(token.clone()));
    let gateway = ScriptedGateway::new(vec![]);
    let session = session(&store, gateway.clone());

    let snapshot = session.initialize().await;

    assert!(snapshot.is_authenticated);
    assert_eq!(snapshot.subject(), Some("alice"));
    assert_eq!(gateway.calls(), 0);
    assert_eq!(store.get(), Some(token));
}

#[tokio::test]
async fn test_malformed_stored_token_triggers_refresh() {
    let store = Arc::new(MemoryStore::with_token("definitely-not-a-jwt"));
    let gateway = ScriptedGateway::new(vec![Ok(valid("bob"))]);
    let session = session(&store, gateway.clone());

    let snapshot = session.initialize().await;

    assert_eq!(snapshot.subject(), Some("bob"));
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn test_token_expiring_exactly_now_is_refreshed() {
    let store = Arc::new(MemoryStore::with_token(mint("alice", epoch())));
    let gateway = ScriptedGateway::new(vec![Err(rejected())]);
    let session = session(&store, gateway.clone());

    let snapshot = session.initialize().await;

    assert_eq!(gateway.calls(), 1);
    assert!(!snapshot.is_authenticated);
}

#[tokio::test]
async fn test_cancelled_initialize_can_be_retried() {
    let store = Arc::new(MemoryStore::new());
    let (gateway, _handles) = ParkedGateway::new();
    let session = session(&store, gateway.clone());

    let abandoned = tokio::time::timeout(Duration::from_millis(20), session.initialize()).await;
    assert!(abandoned.is_err());
    assert_eq!(session.status(), AuthStatus::Uninitialized);

    // The parked call is gone; the retry reaches the gateway again and settles
    let snapshot = session.ensure_fresh().await.unwrap();
    assert_eq!(snapshot.status, AuthStatus::Unauthenticated);
    assert_eq!(snapshot.last_failure, Some(FailureReason::Offline));
    assert_eq!(gateway.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_initialize_waits_for_startup() {
    let store = Arc::new(MemoryStore::new());
    let (gateway, handles) = ParkedGateway::new();
    let session = session(&store, gateway.clone());

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.initialize().await })
    };
    handles.started.await.unwrap();

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.initialize().await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!second.is_finished());

    handles.release.send(Ok(valid("alice"))).unwrap();

    assert_eq!(first.await.unwrap().subject(), Some("alice"));
    assert_eq!(second.await.unwrap().subject(), Some("alice"));
    assert_eq!(gateway.calls(), 1);
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test]
async fn test_login_wins_regardless_of_prior_state() {
    let store = Arc::new(MemoryStore::new());
    let gateway = ScriptedGateway::new(vec![Err(rejected())]);
    let session = session(&store, gateway);

    assert!(!session.initialize().await.is_authenticated);

    let first = valid("alice");
    let snapshot = session.login(&first).unwrap();
    assert!(snapshot.is_authenticated);
    assert_eq!(snapshot.last_failure, None);
    assert_eq!(store.get(), Some(first));

    let second = valid("bob");
    let snapshot = session.login(&second).unwrap();
    assert_eq!(snapshot.subject(), Some("bob"));
    assert_eq!(store.get(), Some(second));
}

// ============================================================================
// Fail-closed refresh
// ============================================================================

#[tokio::test]
async fn test_transport_failure_clears_store_and_is_distinguishable() {
    let store = Arc::new(MemoryStore::new());
    let gateway = ScriptedGateway::new(vec![
        Ok(valid("alice")),
        Err(RefreshError::Transport("connection reset".to_string())),
    ]);
    let session = session(&store, gateway);
    session.initialize().await;
    assert!(session.is_authenticated());

    let err = session.refresh().await.unwrap_err();

    assert!(err.is_transport());
    assert_eq!(session.last_failure(), Some(FailureReason::Offline));
    assert!(!session.is_authenticated());
    assert_eq!(store.get(), None);
}

#[tokio::test]
async fn test_malformed_refreshed_token_fails_closed() {
    let store = Arc::new(MemoryStore::with_token(valid("alice")));
    let gateway = ScriptedGateway::new(vec![Ok("a.b".to_string())]);
    let session = session(&store, gateway);
    session.initialize().await;

    let err = session.refresh().await.unwrap_err();

    assert!(matches!(err, RefreshError::MalformedToken(_)));
    assert_eq!(session.status(), AuthStatus::Unauthenticated);
    assert_eq!(store.get(), None);
}

#[tokio::test]
async fn test_refresh_timeout_fails_closed() {
    let store = Arc::new(MemoryStore::with_token(valid("alice")));
    let session = Arc::new(
        SessionManager::new(store.clone(), Arc::new(SilentGateway))
            .with_clock(clock())
            .with_refresh_timeout(Duration::from_millis(50)),
    );
    session.initialize().await;

    let err = session.refresh().await.unwrap_err();

    assert!(matches!(err, RefreshError::Timeout(_)));
    assert!(err.is_transport());
    assert_eq!(session.last_failure(), Some(FailureReason::TimedOut));
    assert_eq!(store.get(), None);
}

// ============================================================================
// Races
// ============================================================================

#[tokio::test]
async fn test_refresh_result_discarded_after_login() {
    let store = Arc::new(MemoryStore::new());
    let (gateway, handles) = ParkedGateway::new();
    let session = session(&store, gateway.clone());

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.refresh().await })
    };
    handles.started.await.unwrap();

    let token_b = valid("bob");
    session.login(&token_b).unwrap();
    handles.release.send(Ok(valid("alice"))).unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, RefreshOutcome::Superseded(_)));
    assert_eq!(outcome.snapshot().subject(), Some("bob"));
    assert_eq!(session.identity().and_then(|c| c.subject), Some("bob".to_string()));
    assert_eq!(store.get(), Some(token_b));
}

#[tokio::test]
async fn test_refresh_failure_discarded_after_login() {
    let store = Arc::new(MemoryStore::new());
    let (gateway, handles) = ParkedGateway::new();
    let session = session(&store, gateway);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.refresh().await })
    };
    handles.started.await.unwrap();

    let token_b = valid("bob");
    session.login(&token_b).unwrap();
    handles.release.send(Err(rejected())).unwrap();

    assert!(matches!(pending.await.unwrap(), Ok(RefreshOutcome::Superseded(_))));
    assert!(session.is_authenticated());
    assert_eq!(session.last_failure(), None);
    assert_eq!(store.get(), Some(token_b));
}

#[tokio::test]
async fn test_refresh_result_discarded_after_logout() {
    let store = Arc::new(MemoryStore::with_token(valid("alice")));
    let (gateway, handles) = ParkedGateway::new();
    let session = session(&store, gateway);
    session.initialize().await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.refresh().await })
    };
    handles.started.await.unwrap();

    session.logout().unwrap();
    handles.release.send(Ok(valid("alice"))).unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.snapshot().is_authenticated);
    assert!(!session.is_authenticated());
    assert_eq!(store.get(), None);
}

#[tokio::test]
async fn test_overlapping_refreshes_share_one_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let (gateway, handles) = ParkedGateway::new();
    let session = session(&store, gateway.clone());

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.refresh().await })
    };
    handles.started.await.unwrap();

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.refresh().await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    let token = valid("alice");
    handles.release.send(Ok(token.clone())).unwrap();

    assert!(matches!(first.await.unwrap(), Ok(RefreshOutcome::Renewed(_))));
    let second = second.await.unwrap().unwrap();
    assert!(matches!(second, RefreshOutcome::Superseded(_)));
    assert!(second.snapshot().is_authenticated);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(store.get(), Some(token));
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_every_published_snapshot_is_consistent() {
    let store = Arc::new(MemoryStore::with_token(expired("alice")));
    let clock = clock();
    let gateway = ScriptedGateway::new(vec![
        Ok(valid("alice")),
        Err(rejected()),
        Ok(valid("carol")),
    ]);
    let session = SessionManager::new(store.clone(), gateway).with_clock(clock.clone());

    let seen: Arc<Mutex<Vec<SessionSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer_clock = clock.clone();
    session.subscribe(move |snapshot| {
        assert_eq!(snapshot.is_authenticated, snapshot.identity.is_some());
        if let Some(identity) = &snapshot.identity {
            assert!(identity.expires_at > observer_clock.now());
        }
        sink.lock().unwrap().push(snapshot.clone());
    });

    session.initialize().await;
    let _ = session.refresh().await;
    session.login(&valid("bob")).unwrap();
    session.refresh().await.unwrap();
    session.logout().unwrap();
    session.logout().unwrap();

    let seen = seen.lock().unwrap();
    let subjects: Vec<Option<&str>> = seen.iter().map(|s| s.subject()).collect();
    assert_eq!(
        subjects,
        vec![Some("alice"), None, Some("bob"), Some("carol"), None, None]
    );
    assert!(seen.windows(2).all(|w| w[0].revision < w[1].revision));
    assert_eq!(store.get(), None);
}

#[tokio::test]
async fn test_watch_receiver_observes_refresh() {
    let store = Arc::new(MemoryStore::new());
    let gateway = ScriptedGateway::new(vec![Ok(valid("alice"))]);
    let session = session(&store, gateway);
    let mut rx = session.watch();

    session.initialize().await;

    assert!(rx.has_changed().unwrap());
    let latest = rx.borrow_and_update().clone();
    assert_eq!(latest.subject(), Some("alice"));
}

#[tokio::test]
async fn test_access_token_only_while_authenticated() {
    let token = valid("alice");
    let store = Arc::new(MemoryStore::with_token(token.clone()));
    let gateway = ScriptedGateway::new(vec![]);
    let session = session(&store, gateway);

    assert_eq!(session.access_token(), None);
    session.initialize().await;
    assert_eq!(session.access_token(), Some(token));

    let identity = session.identity().unwrap();
    assert_eq!(identity.time_until_expiry(epoch()), ChronoDuration::minutes(15));
    assert_eq!(identity.roles(), vec!["author"]);

    session.logout().unwrap();
    assert_eq!(session.access_token(), None);
}
