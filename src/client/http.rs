use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::ClaudeOptions;

/// Session summary returned by the REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub working_dir: String,
    pub environment_id: String,
    pub session_state: String,
    pub active_connections: u32,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_input: Option<String>,
    #[serde(skip_serializing_if = "ClaudeOptions::is_empty")]
    pub claude_options: ClaudeOptions,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_env_vars: BTreeMap<String, String>,
}

/// Thin REST client for the management endpoints.
pub struct HubClient {
    server: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HubClient {
    /// `server` is a `host:port` authority.
    pub fn new(server: impl Into<String>, token: Option<String>) -> Self {
        Self {
            server: server.into(),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Websocket URL for attaching to `id`.
    pub fn ws_url(&self, id: &str) -> String {
        format!("ws://{}/ws/sessions/{}", self.server, id)
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server, path)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    pub async fn list_sessions(&self) -> io::Result<Vec<SessionSummary>> {
        let resp = self
            .auth(self.http.get(self.url("/sessions")))
            .send()
            .await
            .map_err(|e| self.io_error(e))?;
        let resp = check_status(resp, None).await?;
        resp.json()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub async fn create_session(
        &self,
        id: Option<&str>,
        working_dir: &Path,
        environment_id: Option<&str>,
        initial_input: Option<&str>,
    ) -> io::Result<SessionSummary> {
        self.create_session_with(&CreateRequest {
            id: id.map(str::to_string),
            working_dir: working_dir.to_path_buf(),
            environment_id: environment_id.map(str::to_string),
            initial_input: initial_input.map(str::to_string),
            ..Default::default()
        })
        .await
    }

    pub async fn create_session_with(&self, request: &CreateRequest) -> io::Result<SessionSummary> {
        let resp = self
            .auth(self.http.post(self.url("/sessions")).json(request))
            .send()
            .await
            .map_err(|e| self.io_error(e))?;
        let resp = check_status(resp, None).await?;
        resp.json()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Destroy a session.
    pub async fn stop_session(&self, id: &str) -> io::Result<()> {
        let resp = self
            .auth(self.http.delete(self.url(&format!("/sessions/{}", id))))
            .send()
            .await
            .map_err(|e| self.io_error(e))?;
        check_status(resp, Some(id)).await?;
        Ok(())
    }

    /// Convert a reqwest error into a human-friendly `io::Error`.
    fn io_error(&self, e: reqwest::Error) -> io::Error {
        if e.is_connect() {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!(
                    "could not connect to termhub server at {}; is it running?",
                    self.server
                ),
            )
        } else if e.is_timeout() {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection to termhub server at {} timed out", self.server),
            )
        } else {
            io::Error::new(io::ErrorKind::Other, e)
        }
    }
}

async fn check_status(resp: reqwest::Response, id: Option<&str>) -> io::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 404 {
        if let Some(id) = id {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("session not found: {}", id),
            ));
        }
    }
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("server returned status {}", status));
    Err(io::Error::new(io::ErrorKind::Other, message))
}
