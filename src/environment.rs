//! Execution environments a session can run in.
//!
//! An [`Environment`] is a descriptor only: it names the backend kind and
//! carries the settings that backend needs. Turning a descriptor into a
//! spawnable backend is the job of [`crate::backend::BackendResolver`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Id of the host environment that always exists.
pub const DEFAULT_ENVIRONMENT: &str = "local";

pub const DEFAULT_IMAGE: &str = "claude-code-sandboxed";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Host,
    Docker,
    Ssh,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvironmentKind::Host => "host",
            EnvironmentKind::Docker => "docker",
            EnvironmentKind::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub kind: EnvironmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Host directory holding the assistant's credentials, mounted into
    /// the container. Required for `docker`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,
    /// Name of the running container to exec into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Environment {
    pub fn host(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EnvironmentKind::Host,
            image: None,
            tag: None,
            auth_dir: None,
            container: None,
        }
    }

    pub fn docker(id: impl Into<String>, auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind: EnvironmentKind::Docker,
            image: None,
            tag: None,
            auth_dir: Some(auth_dir.into()),
            container: None,
        }
    }

    pub fn image_ref(&self) -> String {
        format!(
            "{}:{}",
            self.image.as_deref().unwrap_or(DEFAULT_IMAGE),
            self.tag.as_deref().unwrap_or(DEFAULT_TAG)
        )
    }

    pub fn container_name(&self) -> String {
        self.container
            .clone()
            .unwrap_or_else(|| format!("termhub-{}", self.id))
    }
}

/// The set of known environments, keyed by id.
///
/// Always contains a host environment named [`DEFAULT_ENVIRONMENT`].
#[derive(Clone)]
pub struct EnvironmentCatalog {
    inner: Arc<RwLock<HashMap<String, Environment>>>,
}

impl Default for EnvironmentCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl EnvironmentCatalog {
    pub fn new(environments: Vec<Environment>) -> Self {
        let mut map: HashMap<String, Environment> = environments
            .into_iter()
            .map(|env| (env.id.clone(), env))
            .collect();
        map.entry(DEFAULT_ENVIRONMENT.to_string())
            .or_insert_with(|| Environment::host(DEFAULT_ENVIRONMENT));
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn get(&self, id: &str) -> Option<Environment> {
        self.inner.read().get(id).cloned()
    }

    /// Insert or replace an environment, returning the previous descriptor.
    pub fn upsert(&self, environment: Environment) -> Option<Environment> {
        self.inner
            .write()
            .insert(environment.id.clone(), environment)
    }

    pub fn list(&self) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self.inner.read().values().cloned().collect();
        envs.sort_by(|a, b| a.id.cmp(&b.id));
        envs
    }
}
