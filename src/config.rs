use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::LaunchSettings;
use crate::environment::Environment;
use crate::manager::ManagerSettings;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_DESTROY_GRACE_MS: u64 = 300_000;
pub const DEFAULT_INACTIVITY_MINUTES: u64 = 30;
pub const MIN_INACTIVITY_MINUTES: u64 = 5;

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub sessions: SessionsSection,
    /// Execution environments besides the built-in `local` host.
    pub environments: Vec<Environment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: Option<SocketAddr>,
    /// Bearer token required on every API request.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Assistant executable.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub destroy_grace_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
    /// Pause sessions without activity for this many minutes; 0 disables.
    pub inactivity_timeout_minutes: Option<u64>,
    /// Where session records are persisted.
    pub state_file: Option<PathBuf>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Environment settings may carry credentials.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Unusable timing values are ignored with a warning, leaving the file
    /// value or the default in place.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("CLAUDE_CODE_PATH").filter(|v| !v.is_empty()) {
            self.sessions.command = Some(path);
        }
        if let Some(value) = lookup("PTY_DESTROY_GRACE_PERIOD_MS").filter(|v| !v.is_empty()) {
            match parse_u64(&value).filter(|ms| *ms > 0) {
                Some(ms) => self.sessions.destroy_grace_ms = Some(ms),
                None => tracing::warn!(
                    value = %value,
                    default = DEFAULT_DESTROY_GRACE_MS,
                    "ignoring PTY_DESTROY_GRACE_PERIOD_MS, expected a positive integer"
                ),
            }
        }
        if let Some(value) = lookup("PROCESS_IDLE_TIMEOUT_MINUTES").filter(|v| !v.is_empty()) {
            match parse_u64(&value) {
                Some(minutes) => self.sessions.inactivity_timeout_minutes = Some(minutes),
                None => tracing::warn!(
                    value = %value,
                    default = DEFAULT_INACTIVITY_MINUTES,
                    "ignoring PROCESS_IDLE_TIMEOUT_MINUTES, expected a number"
                ),
            }
        }
        if let Some(token) = lookup("TERMHUB_TOKEN").filter(|v| !v.is_empty()) {
            self.server.token = Some(token);
        }
    }

    pub fn bind(&self) -> SocketAddr {
        self.server
            .bind
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)))
    }

    pub fn launch_settings(&self) -> LaunchSettings {
        let defaults = LaunchSettings::default();
        LaunchSettings {
            command: self.sessions.command.clone().unwrap_or(defaults.command),
            args: self.sessions.args.clone(),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let defaults = ManagerSettings::default();
        let s = &self.sessions;
        ManagerSettings {
            destroy_grace: s
                .destroy_grace_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.destroy_grace),
            settle_delay: s
                .settle_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),
            restart_delay: s
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.restart_delay),
            inactivity_timeout: inactivity_timeout(
                s.inactivity_timeout_minutes
                    .unwrap_or(DEFAULT_INACTIVITY_MINUTES),
            ),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.sessions
            .state_file
            .clone()
            .unwrap_or_else(default_state_file)
    }
}

/// Minutes of inactivity before pausing; 0 disables, values below the
/// minimum are raised to it.
pub fn inactivity_timeout(minutes: u64) -> Option<Duration> {
    match minutes {
        0 => None,
        m if m < MIN_INACTIVITY_MINUTES => {
            tracing::warn!(
                minutes = m,
                min = MIN_INACTIVITY_MINUTES,
                "inactivity timeout below minimum, using minimum"
            );
            Some(Duration::from_secs(MIN_INACTIVITY_MINUTES * 60))
        }
        m => Some(Duration::from_secs(m.saturating_mul(60))),
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

pub fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("sessions.json")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain credentials -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
