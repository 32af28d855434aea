//! Server shutdown: viewers get a close frame and session records are left
//! in a state the next boot can pick up.

mod common;

use std::time::Duration;

use common::{fast_settings, start_server, test_hub};
use futures::StreamExt;
use termhub::api::{router, AppState, RouterConfig};
use termhub::backend::BackendResolver;
use termhub::environment::EnvironmentCatalog;
use termhub::manager::{CreateOptions, SessionManager};
use termhub::session::SessionState;
use termhub::store::SessionStore;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn shutdown_closes_viewers_and_persists_states() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("active", dir.path(), CreateOptions::default())
        .unwrap();
    hub.manager
        .create_session("idle", dir.path(), CreateOptions::default())
        .unwrap();
    drop(hub.manager.open_connection("idle").unwrap());
    let idle_deadline = hub.manager.get("idle").unwrap().destroy_at().unwrap();

    let state = AppState::new(hub.manager.clone());
    let addr = start_server(router(state.clone(), RouterConfig::default())).await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/sessions/active", addr))
        .await
        .unwrap();
    let active = hub.manager.get("active").unwrap();
    assert!(common::wait_until(WAIT, || active.active_connections() == 1).await);

    hub.manager.shutdown();
    state.shutdown.shutdown();
    assert!(state.shutdown.wait_for_all_closed(WAIT).await);

    let close = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {:?}", other),
            }
        }
    })
    .await
    .expect("close frame should arrive");
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Normal));

    assert!(hub.manager.registry().is_empty());
    assert!(hub.backend.process(0).is_killed());
    assert!(hub.backend.process(1).is_killed());

    let stored = hub.store.load("active").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Paused);
    assert_eq!(stored.active_connections, 0);
    assert_eq!(stored.destroy_at, None);

    let stored = hub.store.load("idle").unwrap().unwrap();
    assert_eq!(stored.session_state, SessionState::Idle);
    assert_eq!(stored.destroy_at, Some(idle_deadline));

    // The next boot sees the same records.
    let rebooted = SessionManager::new(
        BackendResolver::new(hub.factory.clone()),
        EnvironmentCatalog::default(),
        hub.store.clone(),
        fast_settings(),
    );
    let report = rebooted.reconcile_on_boot();
    assert_eq!(report.rearmed, vec!["idle".to_string()]);
    assert!(report.paused.is_empty());
    assert!(report.destroyed.is_empty());

    let resumed = rebooted.resume("active", None).await.unwrap();
    assert_eq!(resumed.state(), SessionState::Active);
}

#[tokio::test]
async fn new_connections_after_shutdown_are_rejected() {
    let hub = test_hub();
    let dir = tempfile::tempdir().unwrap();
    hub.manager
        .create_session("s1", dir.path(), CreateOptions::default())
        .unwrap();

    hub.manager.shutdown();

    assert!(hub.manager.open_connection("s1").is_err());
    assert!(!hub.manager.has_session("s1"));
}
