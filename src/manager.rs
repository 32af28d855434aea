//! Process lifecycle: spawning, restarting, resuming and tearing down the
//! interactive process behind each session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backend::{
    is_valid_env_key, BackendResolver, ClaudeOptions, ExitInfo, ProcessHandle, SpawnRequest,
};
use crate::broker::Utf8Chunker;
use crate::environment::{Environment, EnvironmentCatalog, DEFAULT_ENVIRONMENT};
use crate::session::{RegistryError, Session, SessionRegistry, SessionState};
use crate::store::{SessionRecord, SessionStore};

const EVENT_CAPACITY: usize = 1024;

/// How long to keep reading output after the exit status arrived.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle and output events for all sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    Data { id: String, chunk: Bytes },
    Exit { id: String, exit: ExitInfo },
    ResumeToken { id: String, token: String },
    Paused { id: String },
    Destroyed { id: String },
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Grace period between the last connection closing and destruction.
    pub destroy_grace: Duration,
    /// Delay before initial input is written to a fresh process.
    pub settle_delay: Duration,
    /// Delay between killing and re-spawning on restart.
    pub restart_delay: Duration,
    /// Pause sessions without input or output for this long.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            destroy_grace: Duration::from_millis(300_000),
            settle_delay: Duration::from_millis(3_000),
            restart_delay: Duration::from_millis(500),
            inactivity_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub environment_id: Option<String>,
    /// Written to the process (with a trailing newline) once it has settled.
    pub initial_input: Option<String>,
    pub resume_token: Option<String>,
    /// Assistant flags for this session, kept across restarts.
    pub claude_options: ClaudeOptions,
    /// Variables added to the process environment.
    pub env: BTreeMap<String, String>,
}

impl CreateOptions {
    /// Options that recreate the process described by `record`.
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            environment_id: Some(record.environment_id.clone()),
            initial_input: None,
            resume_token: None,
            claude_options: record.claude_options.clone(),
            env: record.env.clone(),
        }
    }
}

/// Outcome of applying an environment change.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ApplyReport {
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

/// Owns every session's process and publishes their output.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) registry: SessionRegistry,
    pub(crate) resolver: BackendResolver,
    pub(crate) environments: EnvironmentCatalog,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) settings: ManagerSettings,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        resolver: BackendResolver,
        environments: EnvironmentCatalog,
        store: Arc<dyn SessionStore>,
        settings: ManagerSettings,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: SessionRegistry::new(),
            resolver,
            environments,
            store,
            settings,
            events_tx,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn environments(&self) -> &EnvironmentCatalog {
        &self.environments
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.registry.get(id)
    }

    /// Persisted record for `id`: the live view when the session is running,
    /// otherwise whatever the store holds.
    pub fn record(&self, id: &str) -> Option<SessionRecord> {
        if let Some(session) = self.registry.get(id) {
            return Some(session.record());
        }
        match self.store.load(id) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "failed to load session record");
                None
            }
        }
    }

    /// All known records, live sessions taking precedence over stored ones.
    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list session records");
                Vec::new()
            }
        };
        for session in self.registry.sessions() {
            let live = session.record();
            match records.iter_mut().find(|r| r.id == live.id) {
                Some(slot) => *slot = live,
                None => records.push(live),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Spawn a process for `id` in `working_dir` and register the session.
    ///
    /// A live session with the same id is destroyed first. Nothing is
    /// registered when validation or spawning fails.
    pub fn create_session(
        &self,
        id: &str,
        working_dir: impl AsRef<Path>,
        opts: CreateOptions,
    ) -> Result<Session, RegistryError> {
        let guard = self.registry.begin_create(id)?;
        let working_dir = validate_working_dir(working_dir.as_ref())?;
        validate_env(&opts.env)?;
        let environment_id = opts
            .environment_id
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let environment = self.environment(&environment_id)?;
        let backend = self.resolver.resolve(&environment)?;

        if self.registry.contains(id) {
            tracing::info!(session = %id, "replacing existing session");
            self.destroy_session(id);
        }

        let request = SpawnRequest::new(&working_dir)
            .with_resume_token(opts.resume_token.clone())
            .with_claude_options(opts.claude_options.clone())
            .with_env(opts.env.clone());
        let mut process = backend.spawn(&request).map_err(|e| {
            tracing::error!(session = %id, error = %e, "failed to spawn process");
            RegistryError::Spawn(e)
        })?;
        let streams = take_streams(&mut process);
        let handle_id = process.id();

        let session = Session::new(
            id,
            working_dir,
            environment_id,
            process,
            opts.resume_token,
        )
        .with_launch_options(opts.claude_options, opts.env);
        self.registry.insert(guard, session.clone());
        tracing::info!(
            session = %id,
            environment = %session.environment_id,
            pid = ?session.pid(),
            resumed = session.resume_token().is_some(),
            "session created"
        );

        self.start_pump(&session, handle_id, streams);
        if let Some(input) = opts.initial_input {
            self.send_initial_input(&session, handle_id, input);
        }
        self.watch_inactivity(&session);
        self.persist(&session);
        let _ = self.events_tx.send(SessionEvent::Created { id: id.to_string() });
        Ok(session)
    }

    /// Forward input. A missing session is a logged no-op.
    pub fn write(&self, id: &str, data: &[u8]) {
        match self.registry.get(id) {
            Some(session) => {
                if let Err(e) = session.write(data) {
                    tracing::warn!(session = %id, error = %e, "write failed");
                }
            }
            None => tracing::warn!(session = %id, "write to missing session ignored"),
        }
    }

    /// Resize the terminal. A missing session is a logged no-op.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        match self.registry.get(id) {
            Some(session) => {
                if let Err(e) = session.resize(cols, rows) {
                    tracing::warn!(session = %id, error = %e, "resize failed");
                }
            }
            None => tracing::warn!(session = %id, "resize of missing session ignored"),
        }
    }

    /// Kill the process and spawn a fresh one in the same working directory.
    ///
    /// The registry entry, its id and its attached connections survive;
    /// `has_session` stays true throughout. A session that is not live but
    /// has a stored record is started from that record.
    pub async fn restart(&self, id: &str) -> Result<(), RegistryError> {
        match self.registry.get(id) {
            Some(session) => {
                self.respawn(&session, None, self.settings.restart_delay)
                    .await
            }
            None => {
                let record = self
                    .record(id)
                    .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
                tokio::time::sleep(self.settings.restart_delay).await;
                self.create_session(id, &record.working_dir, CreateOptions::from_record(&record))
                    .map(|_| ())
            }
        }
    }

    /// Re-spawn with the assistant's resume flag so the previous
    /// conversation is restored. Without an explicit token the session's
    /// last known token is used.
    pub async fn resume(&self, id: &str, token: Option<String>) -> Result<Session, RegistryError> {
        if let Some(session) = self.registry.get(id) {
            let token = token.or_else(|| session.resume_token());
            self.respawn(&session, token, Duration::ZERO).await?;
            return Ok(session);
        }

        let record = self
            .record(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        tracing::info!(session = %id, state = %record.session_state, "resuming stored session");
        let opts = CreateOptions {
            resume_token: token.or_else(|| record.resume_token.clone()),
            ..CreateOptions::from_record(&record)
        };
        self.create_session(id, &record.working_dir, opts)
    }

    /// Stop the process and keep the record as `PAUSED`. Returns false when
    /// the session is not live.
    pub fn pause(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(session) => {
                self.teardown(&session, SessionState::Paused);
                let _ = self.events_tx.send(SessionEvent::Paused { id: id.to_string() });
                true
            }
            None => {
                tracing::debug!(session = %id, "pause of missing session ignored");
                false
            }
        }
    }

    /// Kill and de-register. Idempotent: returns false when nothing was live.
    pub fn destroy_session(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(session) => {
                self.teardown(&session, SessionState::Destroyed);
                let _ = self
                    .events_tx
                    .send(SessionEvent::Destroyed { id: id.to_string() });
                true
            }
            None => {
                tracing::debug!(session = %id, "destroy of missing session ignored");
                false
            }
        }
    }

    /// Replace an environment's settings, drop its cached backend and
    /// restart the sessions running on it.
    pub async fn apply_environment(&self, environment: Environment) -> ApplyReport {
        let env_id = environment.id.clone();
        self.environments.upsert(environment);
        self.resolver.invalidate(&env_id);

        let mut targets: Vec<String> = self
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.environment_id == env_id)
            .filter(|s| matches!(s.state(), SessionState::Active | SessionState::Idle))
            .map(|s| s.id.clone())
            .collect();
        targets.sort();

        let mut report = ApplyReport::default();
        for id in targets {
            match self.restart(&id).await {
                Ok(()) => report.restarted.push(id),
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "restart after environment change failed");
                    report.failed.push(id);
                }
            }
        }
        tracing::info!(
            environment = %env_id,
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "environment applied"
        );
        report
    }

    /// Stop every live session for server shutdown. Active sessions are
    /// persisted as `PAUSED`; idle sessions keep their destroy deadline.
    pub fn shutdown(&self) {
        let sessions = self.registry.drain();
        tracing::info!(count = sessions.len(), "stopping sessions for shutdown");
        for session in sessions {
            let state = match session.state() {
                SessionState::Idle => SessionState::Idle,
                _ => SessionState::Paused,
            };
            {
                let mut core = session.lock();
                if let Some(timer) = core.destroy_timer.take() {
                    timer.abort();
                }
                core.state = state;
                core.active_connections = 0;
                if state != SessionState::Idle {
                    core.destroy_at = None;
                }
            }
            session.cancelled.cancel();
            session.kill_process();
            self.persist(&session);
        }
    }

    pub(crate) fn persist(&self, session: &Session) {
        self.persist_record(&session.record());
    }

    pub(crate) fn persist_record(&self, record: &SessionRecord) {
        if let Err(e) = self.store.save(record) {
            tracing::warn!(session = %record.id, error = %e, "failed to persist session record");
        }
    }

    fn environment(&self, id: &str) -> Result<Environment, RegistryError> {
        self.environments
            .get(id)
            .ok_or_else(|| RegistryError::EnvironmentNotFound(id.to_string()))
    }

    /// Final state change for a session already removed from the registry.
    fn teardown(&self, session: &Session, state: SessionState) {
        {
            let mut core = session.lock();
            if let Some(timer) = core.destroy_timer.take() {
                timer.abort();
            }
            core.state = state;
            core.destroy_at = None;
            core.active_connections = 0;
        }
        session.cancelled.cancel();
        session.kill_process();
        self.persist(session);
        tracing::info!(session = %session.id, %state, "session stopped");
    }

    /// Kill the current process and spawn a replacement into the same entry.
    async fn respawn(
        &self,
        session: &Session,
        resume_token: Option<String>,
        delay: Duration,
    ) -> Result<(), RegistryError> {
        let guard = self.registry.begin_create(&session.id)?;
        tracing::info!(session = %session.id, resumed = resume_token.is_some(), "respawning process");
        session.kill_process();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.registry.contains(&session.id) {
            tracing::debug!(session = %session.id, "session removed during respawn");
            return Err(RegistryError::NotFound(session.id.clone()));
        }

        let request = SpawnRequest::new(&session.working_dir)
            .with_resume_token(resume_token.clone())
            .with_claude_options(session.claude_options.clone())
            .with_env(session.env.clone());
        let spawned = self.environment(&session.environment_id).and_then(|env| {
            let backend = self.resolver.resolve(&env)?;
            backend.spawn(&request).map_err(RegistryError::from)
        });

        let mut process = match spawned {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(session = %session.id, error = %e, "respawn failed");
                drop(guard);
                if self.registry.remove(&session.id).is_some() {
                    let exit = ExitInfo::code(1);
                    session.broker.publish_exit(exit.clone());
                    let _ = self.events_tx.send(SessionEvent::Exit {
                        id: session.id.clone(),
                        exit,
                    });
                    self.teardown(session, SessionState::Destroyed);
                }
                return Err(e);
            }
        };

        let streams = take_streams(&mut process);
        let handle_id = process.id();
        if let Some(stale) = session.replace_process(process) {
            stale.kill();
        }
        if let Some(token) = resume_token {
            session.set_resume_token(&token);
        }
        {
            let mut core = session.lock();
            if core.state == SessionState::Paused || core.state == SessionState::Destroyed {
                core.state = SessionState::Active;
            }
        }
        session.activity.touch();
        drop(guard);

        self.start_pump(session, handle_id, streams);
        self.persist(session);
        Ok(())
    }

    fn start_pump(&self, session: &Session, handle_id: u64, streams: Streams) {
        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            manager.pump(session, handle_id, streams).await;
        });
    }

    /// Single emitter for one process: relays output in order, then the exit.
    async fn pump(self, session: Session, handle_id: u64, streams: Streams) {
        let Streams {
            mut output,
            mut exit,
        } = streams;
        let mut chunker = Utf8Chunker::new();

        let info = loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(raw) => {
                        if let Some(text) = chunker.push(&raw) {
                            self.emit_output(&session, handle_id, text);
                        }
                    }
                    None => break (&mut exit).await.unwrap_or_else(|_| ExitInfo::code(1)),
                },
                info = &mut exit => {
                    let info = info.unwrap_or_else(|_| ExitInfo::code(1));
                    while let Ok(Some(raw)) = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, output.recv()).await {
                        if let Some(text) = chunker.push(&raw) {
                            self.emit_output(&session, handle_id, text);
                        }
                    }
                    break info;
                }
            }
        };
        if let Some(text) = chunker.finish() {
            self.emit_output(&session, handle_id, text);
        }
        self.handle_exit(&session, handle_id, info);
    }

    fn emit_output(&self, session: &Session, handle_id: u64, text: Bytes) {
        if session.process_id() != Some(handle_id) {
            return;
        }
        session.activity.touch();
        session.broker.publish(text.clone());

        if session.resume_token().is_none() {
            if let Some(token) = extract_resume_token(&String::from_utf8_lossy(&text)) {
                if session.set_resume_token(token) {
                    tracing::info!(session = %session.id, token = %token, "resume token detected");
                    self.persist(session);
                    let _ = self.events_tx.send(SessionEvent::ResumeToken {
                        id: session.id.clone(),
                        token: token.to_string(),
                    });
                }
            }
        }

        let _ = self.events_tx.send(SessionEvent::Data {
            id: session.id.clone(),
            chunk: text,
        });
    }

    fn handle_exit(&self, session: &Session, handle_id: u64, exit: ExitInfo) {
        if self
            .registry
            .remove_if_process(&session.id, handle_id)
            .is_none()
        {
            tracing::debug!(session = %session.id, handle = handle_id, "ignoring exit of replaced process");
            return;
        }
        tracing::info!(
            session = %session.id,
            exit_code = exit.exit_code,
            signal = ?exit.signal,
            "process exited"
        );
        session.broker.publish_exit(exit.clone());
        let _ = self.events_tx.send(SessionEvent::Exit {
            id: session.id.clone(),
            exit,
        });
        self.teardown(session, SessionState::Destroyed);
    }

    fn send_initial_input(&self, session: &Session, handle_id: u64, input: String) {
        let delay = self.settings.settle_delay;
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if session.process_id() != Some(handle_id) {
                tracing::warn!(session = %session.id, "process gone, skipping initial input");
                return;
            }
            tracing::info!(session = %session.id, len = input.len(), "sending initial input");
            let mut line = input.into_bytes();
            line.push(b'\n');
            if let Err(e) = session.write(&line) {
                tracing::warn!(session = %session.id, error = %e, "initial input failed");
            }
        });
    }

    fn watch_inactivity(&self, session: &Session) {
        let Some(timeout) = self.settings.inactivity_timeout else {
            return;
        };
        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancelled.cancelled() => {}
                _ = session.activity.wait_for_idle(timeout) => {
                    tracing::info!(session = %session.id, ?timeout, "pausing inactive session");
                    manager.pause(&session.id);
                }
            }
        });
    }
}

struct Streams {
    output: mpsc::Receiver<Bytes>,
    exit: oneshot::Receiver<ExitInfo>,
}

fn take_streams(process: &mut ProcessHandle) -> Streams {
    let output = process.take_output().unwrap_or_else(|| mpsc::channel(1).1);
    let exit = process.take_exit().unwrap_or_else(|| {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ExitInfo::code(1));
        rx
    });
    Streams { output, exit }
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<(), RegistryError> {
    match env.keys().find(|key| !is_valid_env_key(key)) {
        Some(key) => Err(RegistryError::InvalidEnvVar(key.clone())),
        None => Ok(()),
    }
}

/// Resolve `dir` and check that it is an existing directory.
pub fn validate_working_dir(dir: &Path) -> Result<PathBuf, RegistryError> {
    let metadata = std::fs::metadata(dir).map_err(|_| RegistryError::InvalidWorkingDirectory {
        path: dir.to_path_buf(),
        reason: "does not exist",
    })?;
    if !metadata.is_dir() {
        return Err(RegistryError::InvalidWorkingDirectory {
            path: dir.to_path_buf(),
            reason: "is not a directory",
        });
    }
    Ok(std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
}

fn resume_token_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\[session:([a-zA-Z0-9-]{4,36})\]",
            r"(?i)Resuming session[:\s]+([a-zA-Z0-9-]{4,36})",
            r"(?i)session[:\s]+([a-zA-Z0-9-]{4,36})",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Find the assistant's conversation id in a chunk of output.
pub fn extract_resume_token(text: &str) -> Option<&str> {
    resume_token_patterns()
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str()))
}
