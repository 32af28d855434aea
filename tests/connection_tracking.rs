//! Connection counting and the idle/destroy scheduler.

mod common;

use std::time::Duration;

use common::{fast_settings, test_hub, test_hub_with};
use termhub::activity::now_ms;
use termhub::backend::BackendResolver;
use termhub::environment::EnvironmentCatalog;
use termhub::manager::{CreateOptions, SessionManager};
use termhub::session::{RegistryError, SessionState};
use termhub::store::SessionStore;
use termhub::tracker::MAX_CONNECTIONS_PER_SESSION;

#[tokio::test]
async fn idle_only_after_last_connection_closes() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    let session = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    let first = hub.manager.open_connection("s1").unwrap();
    let second = hub.manager.open_connection("s1").unwrap();
    assert_eq!(session.active_connections(), 2);

    drop(first);
    assert_eq!(session.active_connections(), 1);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.destroy_at(), None);

    let before = now_ms();
    drop(second);
    assert_eq!(session.active_connections(), 0);
    assert_eq!(session.state(), SessionState::Idle);
    let at = session.destroy_at().expect("idle session has a deadline");
    let grace = fast_settings().destroy_grace.as_millis() as u64;
    assert!(at >= before + grace && at <= now_ms() + grace);

    let stored = hub.store.load("s1").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Idle);
    assert_eq!(stored.active_connections, 0);
    assert_eq!(stored.destroy_at, Some(at));
}

#[tokio::test]
async fn count_tracks_opens_minus_closes() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    let session = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    let mut guards: Vec<_> = (0..5)
        .map(|_| hub.manager.open_connection("s1").unwrap())
        .collect();
    guards.truncate(2);

    assert_eq!(session.active_connections(), 2);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.destroy_at(), None);
    assert_eq!(hub.store.load("s1").unwrap().unwrap().active_connections, 2);
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    let _guards: Vec<_> = (0..MAX_CONNECTIONS_PER_SESSION)
        .map(|_| hub.manager.open_connection("s1").unwrap())
        .collect();
    assert!(matches!(
        hub.manager.open_connection("s1"),
        Err(RegistryError::TooManyConnections(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_grace_cancels_destroy() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    let session = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    let grace = fast_settings().destroy_grace;

    drop(hub.manager.open_connection("s1").unwrap());
    assert_eq!(session.state(), SessionState::Idle);

    tokio::time::sleep(grace / 2).await;
    let guard = hub.manager.open_connection("s1").unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.destroy_at(), None);

    tokio::time::sleep(grace * 2).await;
    assert!(hub.manager.has_session("s1"));
    assert!(!hub.backend.last().is_killed());
    drop(guard);
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_destroys_session() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    let grace = fast_settings().destroy_grace;

    drop(hub.manager.open_connection("s1").unwrap());
    tokio::time::sleep(grace - Duration::from_millis(10)).await;
    assert!(hub.manager.has_session("s1"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::task::yield_now().await;
    assert!(!hub.manager.has_session("s1"));
    assert!(hub.backend.last().is_killed());

    let stored = hub.store.load("s1").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Destroyed);
    assert_eq!(stored.destroy_at, None);
    assert_eq!(stored.active_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn expiry_does_not_touch_a_replacement_session() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    drop(hub.manager.open_connection("s1").unwrap());

    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    tokio::time::sleep(fast_settings().destroy_grace * 2).await;
    assert!(hub.manager.has_session("s1"));
    assert_eq!(hub.manager.get("s1").unwrap().state(), SessionState::Active);
}

#[tokio::test]
async fn open_connection_on_destroyed_session_fails() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    hub.manager.destroy_session("s1");

    assert!(matches!(
        hub.manager.open_connection("s1"),
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn closing_after_destroy_does_not_schedule_timer() {
    let mut settings = fast_settings();
    settings.destroy_grace = Duration::from_millis(20);
    let hub = test_hub_with(settings);
    let dir = tempfile::tempdir().unwrap();
    let session = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    let guard = hub.manager.open_connection("s1").unwrap();
    hub.manager.destroy_session("s1");
    drop(guard);

    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(session.destroy_at(), None);
    assert_eq!(
        hub.store.load("s1").unwrap().unwrap().session_state,
        SessionState::Destroyed
    );
}

#[tokio::test]
async fn stale_guard_after_pause_and_resume_keeps_live_record() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    let old = hub.manager.open_connection("s1").unwrap();

    assert!(hub.manager.pause("s1"));
    let resumed = hub.manager.resume("s1", None).await.unwrap();
    assert_eq!(
        hub.store.load("s1").unwrap().unwrap().session_state,
        SessionState::Active
    );

    drop(old);
    assert_eq!(resumed.state(), SessionState::Active);
    assert_eq!(resumed.destroy_at(), None);
    let stored = hub.store.load("s1").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Active);
    assert_eq!(stored.destroy_at, None);
}

#[tokio::test]
async fn stale_guard_after_recreate_keeps_live_record() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    let old = hub.manager.open_connection("s1").unwrap();

    let replacement = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();
    drop(old);

    assert_eq!(replacement.state(), SessionState::Active);
    let stored = hub.store.load("s1").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Active);

    // After a crash, the next boot still finds a live session to pause.
    let rebooted = SessionManager::new(
        BackendResolver::new(hub.factory.clone()),
        EnvironmentCatalog::default(),
        hub.store.clone(),
        fast_settings(),
    );
    let report = rebooted.reconcile_on_boot();
    assert_eq!(report.paused, vec!["s1".to_string()]);
}

#[tokio::test]
async fn huge_grace_period_saturates_deadline() {
    let mut settings = fast_settings();
    settings.destroy_grace = Duration::from_secs(u64::MAX);
    let hub = test_hub_with(settings);
    let dir = tempfile::tempdir().unwrap();
    let session = hub
        .manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    drop(hub.manager.open_connection("s1").unwrap());
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.destroy_at(), Some(u64::MAX));
}
