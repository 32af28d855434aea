//! Process backends.
//!
//! A backend turns a [`SpawnRequest`] into a running interactive process and
//! hands back a [`ProcessHandle`]. Every backend honours the same contract:
//! `spawn` on the [`Backend`], then `write`, `resize` and `kill` on the
//! handle's [`ProcessControl`]. Which backend serves an environment is
//! decided by the [`BackendResolver`].

pub mod container;
pub mod local;
pub mod resolver;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::environment::EnvironmentKind;
use crate::pty::PtyError;

pub use container::ContainerExecBackend;
pub use local::LocalPtyBackend;
pub use resolver::{BackendFactory, BackendResolver, DefaultBackendFactory};

/// Initial geometry of every spawned process.
pub const INITIAL_COLS: u16 = 80;
pub const INITIAL_ROWS: u16 = 24;

/// Host variables forwarded to the assistant process. Everything else is
/// dropped so server secrets never leak into a session.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "TEMP",
    "TMP",
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CODE_USE_BEDROCK",
    "CLAUDE_CODE_USE_VERTEX",
];

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("environment {id} is misconfigured: {reason}")]
    Misconfigured { id: String, reason: String },

    #[error("environment type {0} is not yet implemented")]
    Unsupported(EnvironmentKind),

    #[error("process input queue is full")]
    InputFull,

    #[error("process has exited")]
    ProcessGone,
}

/// How to launch the assistant, shared by all backends.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Executable name or path of the assistant CLI.
    pub command: String,
    /// Arguments placed before any resume flag.
    pub args: Vec<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
        }
    }
}

impl LaunchSettings {
    /// Full argument vector (program first) for a process on the host.
    ///
    /// `dangerouslySkipPermissions` is never honoured here.
    pub fn argv(&self, request: &SpawnRequest) -> Vec<String> {
        self.build_argv(request, false)
    }

    /// Argument vector for a process inside a sandbox container.
    pub fn sandboxed_argv(&self, request: &SpawnRequest) -> Vec<String> {
        self.build_argv(request, true)
    }

    fn build_argv(&self, request: &SpawnRequest, sandboxed: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv.extend(request.claude_options.cli_args(sandboxed));
        if let Some(token) = &request.resume_token {
            argv.push("--resume".to_string());
            argv.push(token.clone());
        }
        argv
    }
}

/// Assistant CLI flags chosen per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClaudeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    /// Extra flags, whitespace separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_flags: Option<String>,
    /// Only honoured inside a sandbox container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dangerously_skip_permissions: Option<bool>,
}

impl ClaudeOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// CLI arguments for these options. Empty strings count as unset.
    pub fn cli_args(&self, sandboxed: bool) -> Vec<String> {
        let mut args = Vec::new();
        let flags = [
            ("--model", &self.model),
            ("--allowedTools", &self.allowed_tools),
            ("--permission-mode", &self.permission_mode),
        ];
        for (flag, value) in flags {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        if let Some(extra) = &self.additional_flags {
            // Control characters act as separators so a pasted newline
            // cannot smuggle in a second command line.
            args.extend(
                extra
                    .split(|c: char| c.is_whitespace() || c.is_control())
                    .filter(|part| !part.is_empty())
                    .map(str::to_string),
            );
        }
        if self.dangerously_skip_permissions == Some(true) {
            if sandboxed {
                args.push("--dangerously-skip-permissions".to_string());
            } else {
                tracing::warn!("ignoring dangerouslySkipPermissions outside a container");
            }
        }
        args
    }
}

/// Whether `key` is a POSIX-style variable name: upper-case letters,
/// digits and underscores, not starting with a digit.
pub fn is_valid_env_key(key: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").ok())
        .as_ref()
        .map(|re| re.is_match(key))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub working_dir: PathBuf,
    pub resume_token: Option<String>,
    pub claude_options: ClaudeOptions,
    /// Extra variables set on top of the allowlisted host environment.
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnRequest {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            resume_token: None,
            claude_options: ClaudeOptions::default(),
            env: BTreeMap::new(),
            cols: INITIAL_COLS,
            rows: INITIAL_ROWS,
        }
    }

    pub fn with_resume_token(mut self, token: Option<String>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn with_claude_options(mut self, options: ClaudeOptions) -> Self {
        self.claude_options = options;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Custom variables with valid names; anything else is skipped.
    pub fn custom_env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|(k, v)| {
            if is_valid_env_key(k) {
                Some((k.as_str(), v.as_str()))
            } else {
                tracing::warn!(key = %k, "skipping invalid environment variable name");
                None
            }
        })
    }
}

/// How a process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: u32,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(exit_code: u32) -> Self {
        Self {
            exit_code,
            signal: None,
        }
    }
}

impl From<portable_pty::ExitStatus> for ExitInfo {
    fn from(status: portable_pty::ExitStatus) -> Self {
        // portable-pty only exposes the signal through Display, as the
        // strsignal(3) description.
        let text = status.to_string();
        Self {
            exit_code: status.exit_code(),
            signal: text.strip_prefix("Terminated by ").map(signal_name),
        }
    }
}

#[cfg(unix)]
const SIGNAL_NAMES: &[(libc::c_int, &str)] = &[
    (libc::SIGHUP, "SIGHUP"),
    (libc::SIGINT, "SIGINT"),
    (libc::SIGQUIT, "SIGQUIT"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGTRAP, "SIGTRAP"),
    (libc::SIGABRT, "SIGABRT"),
    (libc::SIGBUS, "SIGBUS"),
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGKILL, "SIGKILL"),
    (libc::SIGUSR1, "SIGUSR1"),
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGUSR2, "SIGUSR2"),
    (libc::SIGPIPE, "SIGPIPE"),
    (libc::SIGALRM, "SIGALRM"),
    (libc::SIGTERM, "SIGTERM"),
];

/// `SIG*` name for a signal description as produced by strsignal(3), or
/// the description unchanged when it matches no known signal.
#[cfg(unix)]
pub fn signal_name(description: &str) -> String {
    if let Some(num) = description
        .strip_prefix("Signal ")
        .and_then(|n| n.trim().parse::<libc::c_int>().ok())
    {
        if let Some((_, name)) = SIGNAL_NAMES.iter().find(|(n, _)| *n == num) {
            return name.to_string();
        }
    }
    for &(num, name) in SIGNAL_NAMES {
        let ptr = unsafe { libc::strsignal(num) };
        if ptr.is_null() {
            continue;
        }
        let text = unsafe { std::ffi::CStr::from_ptr(ptr) };
        if text.to_string_lossy() == description {
            return name.to_string();
        }
    }
    description.to_string()
}

#[cfg(not(unix))]
pub fn signal_name(description: &str) -> String {
    description.to_string()
}

/// Launches processes for one environment.
pub trait Backend: Send + Sync {
    fn kind(&self) -> EnvironmentKind;

    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, BackendError>;
}

/// Control surface of one running process.
pub trait ProcessControl: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), BackendError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError>;

    /// Terminate the process. Idempotent.
    fn kill(&self);

    fn pid(&self) -> Option<u32> {
        None
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A running process plus its output and exit streams.
///
/// Output and exit receivers are taken once by whoever pumps the process.
/// Dropping the handle kills the process.
pub struct ProcessHandle {
    id: u64,
    control: Arc<dyn ProcessControl>,
    output: Option<mpsc::Receiver<Bytes>>,
    exit: Option<oneshot::Receiver<ExitInfo>>,
}

impl ProcessHandle {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        output: mpsc::Receiver<Bytes>,
        exit: oneshot::Receiver<ExitInfo>,
    ) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            control,
            output: Some(output),
            exit: Some(exit),
        }
    }

    /// Unique id of this handle; a respawn always yields a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        self.control.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.control.resize(cols, rows)
    }

    pub fn kill(&self) {
        self.control.kill();
    }

    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output.take()
    }

    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitInfo>> {
        self.exit.take()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.control.kill();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .finish()
    }
}
