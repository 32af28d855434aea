//! Persistence boundary for session records.
//!
//! The core only reads and writes the fields of [`SessionRecord`]; where they
//! live is up to the [`SessionStore`] implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ClaudeOptions;
use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access session store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse session store {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub working_dir: PathBuf,
    pub environment_id: String,
    #[serde(default)]
    pub resume_token: Option<String>,
    pub session_state: SessionState,
    #[serde(default)]
    pub active_connections: u32,
    /// Epoch milliseconds at which the idle session is destroyed.
    #[serde(default)]
    pub destroy_at: Option<u64>,
    /// Epoch milliseconds of the last input or output.
    #[serde(default)]
    pub last_activity_at: u64,
    #[serde(default, skip_serializing_if = "ClaudeOptions::is_empty")]
    pub claude_options: ClaudeOptions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

/// Records kept in memory only; lost when the server exits.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }
}

/// Records kept in a single JSON file, rewritten atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, SessionRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing records. A missing file
    /// is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => {
                let list: Vec<SessionRecord> =
                    serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                list.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, records: &BTreeMap<String, SessionRecord>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let list: Vec<&SessionRecord> = records.values().collect();
        let contents = serde_json::to_string_pretty(&list).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        records.insert(record.id.clone(), record.clone());
        self.flush(&records)
    }

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
