use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::backend::ClaudeOptions;
use crate::environment::{Environment, EnvironmentKind};
use crate::manager::{ApplyReport, CreateOptions};
use crate::session::SessionState;
use crate::store::SessionRecord;

use super::error::ApiError;
use super::AppState;

const MAX_ID_LEN: usize = 128;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.manager.registry().len(),
    })
}

/// A session record plus whether a process is running for it right now.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SessionView {
    #[serde(flatten)]
    record: SessionRecord,
    live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

fn view(state: &AppState, record: SessionRecord) -> SessionView {
    let pid = state.manager.get(&record.id).and_then(|s| s.pid());
    SessionView {
        live: state.manager.has_session(&record.id),
        pid,
        record,
    }
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionView>> {
    let records = state.manager.records();
    Json(records.into_iter().map(|r| view(&state, r)).collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    #[serde(default)]
    id: Option<String>,
    working_dir: PathBuf,
    #[serde(default)]
    environment_id: Option<String>,
    #[serde(default)]
    initial_input: Option<String>,
    #[serde(default)]
    resume_token: Option<String>,
    #[serde(default)]
    claude_options: ClaudeOptions,
    #[serde(default)]
    custom_env_vars: BTreeMap<String, String>,
}

fn validate_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ApiError::InvalidRequest(format!(
            "session id must be 1-{} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::InvalidRequest(
            "session id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let id = req
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    validate_id(&id)?;

    let session = state.manager.create_session(
        &id,
        &req.working_dir,
        CreateOptions {
            environment_id: req.environment_id,
            initial_input: req.initial_input,
            resume_token: req.resume_token,
            claude_options: req.claude_options,
            env: req.custom_env_vars,
        },
    )?;
    Ok((StatusCode::CREATED, Json(view(&state, session.record()))))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let record = state
        .manager
        .record(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;
    Ok(Json(view(&state, record)))
}

/// Destroy a session. Live sessions are killed; a stored paused or idle
/// record is marked destroyed so it cannot be resumed.
pub(super) async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.manager.destroy_session(&id) {
        return Ok(StatusCode::NO_CONTENT);
    }
    match state.manager.record(&id) {
        Some(mut record) => {
            if !record.session_state.is_terminal() {
                record.session_state = SessionState::Destroyed;
                record.active_connections = 0;
                record.destroy_at = None;
                state.manager.persist_record(&record);
            }
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::SessionNotFound(id)),
    }
}

pub(super) async fn session_restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.restart(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct ResumeRequest {
    #[serde(default)]
    resume_token: Option<String>,
}

/// Body is optional; an empty body resumes with the stored token.
pub(super) async fn session_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SessionView>, ApiError> {
    let req: ResumeRequest = if body.is_empty() {
        ResumeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    };
    let session = state.manager.resume(&id, req.resume_token).await?;
    Ok(Json(view(&state, session.record())))
}

pub(super) async fn session_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.manager.pause(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

pub(super) async fn environment_list(State(state): State<AppState>) -> Json<Vec<Environment>> {
    Json(state.manager.environments().list())
}

#[derive(Deserialize)]
pub(super) struct EnvironmentRequest {
    kind: EnvironmentKind,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    auth_dir: Option<PathBuf>,
    #[serde(default)]
    container: Option<String>,
}

pub(super) async fn environment_put(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnvironmentRequest>,
) -> Result<Json<ApplyReport>, ApiError> {
    validate_id(&id)?;
    if req.kind == EnvironmentKind::Docker && req.auth_dir.is_none() {
        return Err(ApiError::InvalidEnvironment(
            "docker environments require auth_dir".into(),
        ));
    }
    let environment = Environment {
        id,
        kind: req.kind,
        image: req.image,
        tag: req.tag,
        auth_dir: req.auth_dir,
        container: req.container,
    };
    Ok(Json(state.manager.apply_environment(environment).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(validate_id("s1").is_ok());
        assert!(validate_id("f47ac10b-58cc-4372-a567-0e02b2c3d479").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }
}
