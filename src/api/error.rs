use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::backend::BackendError;
use crate::session::RegistryError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 404 - No live or stored session with this id.
    SessionNotFound(String),
    /// 404 - No environment with this id.
    EnvironmentNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Working directory missing or not a directory.
    InvalidWorkingDirectory(String),
    /// 400 - Environment cannot be used as configured.
    InvalidEnvironment(String),
    /// 409 - A create or respawn for this id is already running.
    SessionBusy(String),
    /// 503 - Connection limit for the session reached.
    TooManyConnections(String),
    /// 500 - The process could not be started.
    SpawnFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::EnvironmentNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidWorkingDirectory(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidEnvironment(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionBusy(_) => StatusCode::CONFLICT,
            ApiError::TooManyConnections(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::EnvironmentNotFound(_) => "environment_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidWorkingDirectory(_) => "invalid_working_directory",
            ApiError::InvalidEnvironment(_) => "invalid_environment",
            ApiError::SessionBusy(_) => "session_busy",
            ApiError::TooManyConnections(_) => "too_many_connections",
            ApiError::SpawnFailed(_) => "spawn_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::EnvironmentNotFound(id) => format!("Environment not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidWorkingDirectory(detail) => detail.clone(),
            ApiError::InvalidEnvironment(detail) => format!("Invalid environment: {}.", detail),
            ApiError::SessionBusy(id) => {
                format!("Session {} is already being created or restarted.", id)
            }
            ApiError::TooManyConnections(id) => {
                format!("Too many connections to session {}.", id)
            }
            ApiError::SpawnFailed(detail) => format!("Failed to start process: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            e @ RegistryError::InvalidWorkingDirectory { .. } => {
                ApiError::InvalidWorkingDirectory(e.to_string())
            }
            RegistryError::SessionAlreadyCreating(id) => ApiError::SessionBusy(id),
            RegistryError::EnvironmentNotFound(id) => ApiError::EnvironmentNotFound(id),
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            RegistryError::TooManyConnections(id) => ApiError::TooManyConnections(id),
            e @ RegistryError::InvalidEnvVar(_) => ApiError::InvalidRequest(e.to_string()),
            RegistryError::Spawn(
                e @ (BackendError::Misconfigured { .. } | BackendError::Unsupported(_)),
            ) => ApiError::InvalidEnvironment(e.to_string()),
            RegistryError::Spawn(e) => ApiError::SpawnFailed(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
