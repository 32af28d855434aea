use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::backend::{BackendError, ClaudeOptions, ProcessHandle};
use crate::broker::Broker;
use crate::store::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    Idle,
    Paused,
    Destroyed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Destroyed
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Active => "ACTIVE",
            SessionState::Idle => "IDLE",
            SessionState::Paused => "PAUSED",
            SessionState::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workingDir {} {}", .path.display(), .reason)]
    InvalidWorkingDirectory { path: PathBuf, reason: &'static str },
    #[error("session creation already in progress: {0}")]
    SessionAlreadyCreating(String),
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid environment variable name: {0}")]
    InvalidEnvVar(String),
    #[error("too many connections to session: {0}")]
    TooManyConnections(String),
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] BackendError),
}

/// Mutable per-session state, guarded by one lock so the connection count,
/// state and destroy deadline always change together.
pub(crate) struct SessionCore {
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) resume_token: Option<String>,
    pub(crate) active_connections: u32,
    pub(crate) state: SessionState,
    pub(crate) destroy_at: Option<u64>,
    pub(crate) destroy_timer: Option<JoinHandle<()>>,
}

/// A live session: a working directory paired with one interactive process.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub working_dir: PathBuf,
    pub environment_id: String,
    /// Assistant flags reused by every respawn.
    pub claude_options: ClaudeOptions,
    pub env: BTreeMap<String, String>,
    pub broker: Broker,
    pub activity: ActivityTracker,
    /// Fired when the session is destroyed or paused; attached transports
    /// close when they observe it.
    pub cancelled: CancellationToken,
    core: Arc<Mutex<SessionCore>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        environment_id: impl Into<String>,
        process: ProcessHandle,
        resume_token: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            working_dir: working_dir.into(),
            environment_id: environment_id.into(),
            claude_options: ClaudeOptions::default(),
            env: BTreeMap::new(),
            broker: Broker::new(),
            activity: ActivityTracker::new(),
            cancelled: CancellationToken::new(),
            core: Arc::new(Mutex::new(SessionCore {
                process: Some(process),
                resume_token,
                active_connections: 0,
                state: SessionState::Active,
                destroy_at: None,
                destroy_timer: None,
            })),
        }
    }

    pub fn with_launch_options(
        mut self,
        claude_options: ClaudeOptions,
        env: BTreeMap<String, String>,
    ) -> Self {
        self.claude_options = claude_options;
        self.env = env;
        self
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock()
    }

    /// Forward input to the process. Refreshes `lastActivityAt`.
    pub fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        self.activity.touch();
        match self.core.lock().process.as_ref() {
            Some(process) => process.write(data),
            None => Err(BackendError::ProcessGone),
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.activity.touch();
        match self.core.lock().process.as_ref() {
            Some(process) => process.resize(cols, rows),
            None => Err(BackendError::ProcessGone),
        }
    }

    /// Id of the process handle currently owned by this session.
    pub fn process_id(&self) -> Option<u64> {
        self.core.lock().process.as_ref().map(ProcessHandle::id)
    }

    pub fn pid(&self) -> Option<u32> {
        self.core.lock().process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Install a new process, returning the one it replaces.
    pub(crate) fn replace_process(&self, process: ProcessHandle) -> Option<ProcessHandle> {
        self.core.lock().process.replace(process)
    }

    /// Take the process out of the session and kill it.
    pub fn kill_process(&self) {
        let process = self.core.lock().process.take();
        if let Some(process) = process {
            tracing::debug!(session = %self.id, handle = process.id(), "killing process");
            process.kill();
        }
    }

    pub fn resume_token(&self) -> Option<String> {
        self.core.lock().resume_token.clone()
    }

    /// Store a newly observed resume token. Returns false when it is already known.
    pub(crate) fn set_resume_token(&self, token: &str) -> bool {
        let mut core = self.core.lock();
        if core.resume_token.as_deref() == Some(token) {
            return false;
        }
        core.resume_token = Some(token.to_string());
        true
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().state
    }

    pub fn active_connections(&self) -> u32 {
        self.core.lock().active_connections
    }

    pub fn destroy_at(&self) -> Option<u64> {
        self.core.lock().destroy_at
    }

    /// Whether both handles refer to the same registry entry.
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Snapshot of the persisted fields.
    pub fn record(&self) -> SessionRecord {
        let core = self.core.lock();
        SessionRecord {
            id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            environment_id: self.environment_id.clone(),
            resume_token: core.resume_token.clone(),
            session_state: core.state,
            active_connections: core.active_connections,
            destroy_at: core.destroy_at,
            last_activity_at: self.activity.last_activity_at(),
            claude_options: self.claude_options.clone(),
            env: self.env.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("working_dir", &self.working_dir)
            .field("environment_id", &self.environment_id)
            .finish()
    }
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    creating: HashSet<String>,
}

/// Live sessions keyed by id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a creation in flight for one id; released on drop.
#[must_use]
pub struct CreationGuard {
    id: String,
    inner: Arc<RwLock<RegistryInner>>,
}

impl CreationGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        self.inner.write().creating.remove(&self.id);
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                creating: HashSet::new(),
            })),
        }
    }

    /// Claim the right to create `id`. Fails while another creation for the
    /// same id holds its guard.
    pub fn begin_create(&self, id: &str) -> Result<CreationGuard, RegistryError> {
        let mut inner = self.inner.write();
        if !inner.creating.insert(id.to_string()) {
            return Err(RegistryError::SessionAlreadyCreating(id.to_string()));
        }
        Ok(CreationGuard {
            id: id.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Insert a session under a held creation guard. Returns the entry it
    /// replaced, if any.
    pub fn insert(&self, guard: CreationGuard, session: Session) -> Option<Session> {
        debug_assert_eq!(guard.id, session.id);
        let replaced = self
            .inner
            .write()
            .sessions
            .insert(session.id.clone(), session);
        drop(guard);
        replaced
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    pub fn is_creating(&self, id: &str) -> bool {
        self.inner.read().creating.contains(id)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.inner.write().sessions.remove(id)
    }

    /// Remove `id` only while it still owns the process handle `handle_id`.
    ///
    /// Exit notifications from a replaced process must not prune the entry
    /// that replaced it.
    pub fn remove_if_process(&self, id: &str, handle_id: u64) -> Option<Session> {
        let mut inner = self.inner.write();
        let owns = inner
            .sessions
            .get(id)
            .map(|s| s.process_id() == Some(handle_id))
            .unwrap_or(false);
        if owns {
            inner.sessions.remove(id)
        } else {
            None
        }
    }

    /// Ids of all live sessions, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session, returning them.
    pub fn drain(&self) -> Vec<Session> {
        self.inner
            .write()
            .sessions
            .drain()
            .map(|(_, s)| s)
            .collect()
    }
}
