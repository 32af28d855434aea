//! Connection counting and the idle/destroy scheduler.
//!
//! Every transport attachment holds a [`ConnectionGuard`]. The count it
//! maintains drives the per-session state machine:
//!
//! ```text
//! ACTIVE --last close--> IDLE --grace elapsed--> DESTROYED
//!   ^                      |
//!   +-------- open --------+
//! ```
//!
//! `destroy_at` is set exactly while the session is `IDLE` with no
//! connections, and is persisted so a restarted server can finish the job.

use std::time::Duration;

use crate::activity::now_ms;
use crate::manager::SessionManager;
use crate::session::{RegistryError, Session, SessionState};

/// Maximum simultaneous connections to one session.
pub const MAX_CONNECTIONS_PER_SESSION: u32 = 64;

/// RAII handle for one live connection; closing it is dropping it.
pub struct ConnectionGuard {
    manager: SessionManager,
    session: Session,
}

impl ConnectionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.on_connection_close(&self.session);
    }
}

/// What boot reconciliation did with the stored records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub destroyed: Vec<String>,
    pub paused: Vec<String>,
    pub rearmed: Vec<String>,
}

impl SessionManager {
    /// Register a new connection to a live session.
    ///
    /// Cancels a pending destroy timer and returns the session to `ACTIVE`.
    pub fn open_connection(&self, id: &str) -> Result<ConnectionGuard, RegistryError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let count = {
            let mut core = session.lock();
            if !matches!(core.state, SessionState::Active | SessionState::Idle) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            if core.active_connections >= MAX_CONNECTIONS_PER_SESSION {
                tracing::warn!(session = %id, "connection limit reached");
                return Err(RegistryError::TooManyConnections(id.to_string()));
            }
            core.active_connections += 1;
            if let Some(timer) = core.destroy_timer.take() {
                timer.abort();
                tracing::info!(session = %id, "destroy timer cancelled by reconnect");
            }
            core.state = SessionState::Active;
            core.destroy_at = None;
            core.active_connections
        };
        tracing::debug!(session = %id, connections = count, "connection opened");
        self.persist(&session);

        Ok(ConnectionGuard {
            manager: self.clone(),
            session,
        })
    }

    fn on_connection_close(&self, session: &Session) {
        let scheduled = {
            let mut core = session.lock();
            core.active_connections = core.active_connections.saturating_sub(1);
            tracing::debug!(session = %session.id, connections = core.active_connections, "connection closed");

            let live = core.state == SessionState::Active && !session.cancelled.is_cancelled();
            if core.active_connections == 0 && live {
                let grace = self.settings.destroy_grace;
                core.state = SessionState::Idle;
                let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
                core.destroy_at = Some(now_ms().saturating_add(grace_ms));
                core.destroy_timer = self.spawn_destroy_timer(session, grace);
                Some(grace)
            } else {
                None
            }
        };
        if let Some(grace) = scheduled {
            tracing::info!(session = %session.id, ?grace, "last connection closed, session idle");
        }
        // A guard outliving a pause or replacement must not clobber the
        // record of whatever now runs under this id.
        let current = self
            .registry
            .get(&session.id)
            .is_some_and(|s| s.same_as(session));
        if current {
            self.persist(session);
        } else {
            tracing::debug!(session = %session.id, "stale connection closed, record left alone");
        }
    }

    fn spawn_destroy_timer(
        &self,
        session: &Session,
        grace: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(session = %session.id, "no runtime, destroy timer not started");
                return None;
            }
        };
        let manager = self.clone();
        let session = session.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            manager.expire(&session);
        }))
    }

    /// Destroy timer fired: destroy only if still idle with no connections.
    fn expire(&self, session: &Session) {
        {
            let mut core = session.lock();
            if core.active_connections > 0 || core.state != SessionState::Idle {
                return;
            }
            // Detach our own handle so teardown does not abort us.
            core.destroy_timer.take();
        }
        let current = self.registry.get(&session.id);
        if !current.map(|c| c.same_as(session)).unwrap_or(false) {
            return;
        }
        tracing::info!(session = %session.id, "idle grace period elapsed, destroying session");
        self.destroy_session(&session.id);
    }

    /// Bring stored records in line with a freshly started server, where no
    /// process from a previous run is alive.
    pub fn reconcile_on_boot(&self) -> ReconcileReport {
        self.reconcile_at(now_ms())
    }

    pub(crate) fn reconcile_at(&self, now: u64) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read session records for reconciliation");
                return report;
            }
        };

        for mut record in records {
            if record.session_state.is_terminal() || self.registry.contains(&record.id) {
                continue;
            }

            if !record.working_dir.is_dir() {
                tracing::info!(session = %record.id, dir = %record.working_dir.display(), "working directory gone, destroying orphan");
                record.session_state = SessionState::Destroyed;
                record.active_connections = 0;
                record.destroy_at = None;
                self.persist_record(&record);
                report.destroyed.push(record.id);
                continue;
            }

            match (record.session_state, record.destroy_at) {
                (SessionState::Idle, Some(at)) if at <= now => {
                    tracing::info!(session = %record.id, "destroy deadline passed while down");
                    record.session_state = SessionState::Destroyed;
                    record.active_connections = 0;
                    record.destroy_at = None;
                    self.persist_record(&record);
                    report.destroyed.push(record.id);
                }
                (SessionState::Idle, Some(at)) => {
                    let remaining = Duration::from_millis(at - now);
                    tracing::info!(session = %record.id, ?remaining, "destroy timer re-armed");
                    record.active_connections = 0;
                    self.persist_record(&record);
                    self.spawn_stored_expiry(record.id.clone(), at, remaining);
                    report.rearmed.push(record.id);
                }
                (SessionState::Paused, _) => {
                    if record.active_connections != 0 || record.destroy_at.is_some() {
                        record.active_connections = 0;
                        record.destroy_at = None;
                        self.persist_record(&record);
                    }
                }
                _ => {
                    tracing::info!(session = %record.id, "process lost with previous run, pausing");
                    record.session_state = SessionState::Paused;
                    record.active_connections = 0;
                    record.destroy_at = None;
                    self.persist_record(&record);
                    report.paused.push(record.id);
                }
            }
        }
        report
    }

    /// Timer for a stored idle session that has no live process. It only
    /// fires if nothing woke the session in the meantime.
    fn spawn_stored_expiry(&self, id: String, at: u64, remaining: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if manager.registry.contains(&id) {
                return;
            }
            let record = match manager.store.load(&id) {
                Ok(Some(record)) => record,
                _ => return,
            };
            if record.session_state != SessionState::Idle || record.destroy_at != Some(at) {
                return;
            }
            tracing::info!(session = %id, "idle grace period elapsed, destroying stored session");
            let mut record = record;
            record.session_state = SessionState::Destroyed;
            record.destroy_at = None;
            manager.persist_record(&record);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::backend::{BackendResolver, LaunchSettings};
    use crate::environment::EnvironmentCatalog;
    use crate::manager::ManagerSettings;
    use crate::store::{MemoryStore, SessionRecord, SessionStore};

    fn manager_with(store: Arc<MemoryStore>) -> SessionManager {
        SessionManager::new(
            BackendResolver::with_settings(LaunchSettings::default()),
            EnvironmentCatalog::default(),
            store,
            ManagerSettings::default(),
        )
    }

    fn record(id: &str, dir: PathBuf, state: SessionState, destroy_at: Option<u64>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            working_dir: dir,
            environment_id: "local".to_string(),
            resume_token: Some("tok-1".to_string()),
            session_state: state,
            active_connections: 2,
            destroy_at,
            last_activity_at: 0,
            claude_options: Default::default(),
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn reconcile_destroys_expired_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .save(&record("s1", dir.path().into(), SessionState::Idle, Some(1_000)))
            .unwrap();

        let report = manager_with(store.clone()).reconcile_at(2_000);

        assert_eq!(report.destroyed, vec!["s1".to_string()]);
        let stored = store.load("s1").unwrap().unwrap();
        assert_eq!(stored.session_state, SessionState::Destroyed);
        assert_eq!(stored.destroy_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_rearms_future_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .save(&record("s1", dir.path().into(), SessionState::Idle, Some(5_000)))
            .unwrap();

        let report = manager_with(store.clone()).reconcile_at(2_000);
        assert_eq!(report.rearmed, vec!["s1".to_string()]);

        let stored = store.load("s1").unwrap().unwrap();
        assert_eq!(stored.session_state, SessionState::Idle);
        assert_eq!(stored.destroy_at, Some(5_000));
        assert_eq!(stored.active_connections, 0);

        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert_eq!(
            store.load("s1").unwrap().unwrap().session_state,
            SessionState::Idle
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            store.load("s1").unwrap().unwrap().session_state,
            SessionState::Destroyed
        );
    }

    #[tokio::test]
    async fn reconcile_pauses_lost_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .save(&record("s1", dir.path().into(), SessionState::Active, None))
            .unwrap();

        let report = manager_with(store.clone()).reconcile_at(2_000);

        assert_eq!(report.paused, vec!["s1".to_string()]);
        let stored = store.load("s1").unwrap().unwrap();
        assert_eq!(stored.session_state, SessionState::Paused);
        assert_eq!(stored.active_connections, 0);
        assert_eq!(stored.resume_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn reconcile_destroys_orphans_and_skips_terminal() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(&record("gone", "/does/not/exist".into(), SessionState::Paused, None))
            .unwrap();
        store
            .save(&record("done", "/does/not/exist".into(), SessionState::Destroyed, None))
            .unwrap();

        let report = manager_with(store.clone()).reconcile_at(2_000);

        assert_eq!(report.destroyed, vec!["gone".to_string()]);
        assert!(report.paused.is_empty());
        assert_eq!(
            store.load("gone").unwrap().unwrap().session_state,
            SessionState::Destroyed
        );
    }

    #[tokio::test]
    async fn open_connection_on_missing_session_fails() {
        let manager = manager_with(Arc::new(MemoryStore::new()));
        assert!(matches!(
            manager.open_connection("nope"),
            Err(RegistryError::NotFound(_))
        ));
    }
}
