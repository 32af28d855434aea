pub mod auth;
pub mod error;
mod handlers;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::manager::SessionManager;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            shutdown: ShutdownCoordinator::new(),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub token: Option<String>,
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let protected = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route("/sessions/{id}", get(session_get).delete(session_delete))
        .route("/sessions/{id}/restart", post(session_restart))
        .route("/sessions/{id}/resume", post(session_resume))
        .route("/sessions/{id}/pause", post(session_pause))
        .route("/environments", get(environment_list))
        .route("/environments/{id}", put(environment_put))
        .route("/ws/sessions/{id}", get(ws::ws_session))
        .with_state(state.clone());

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => protected,
    };

    let router = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // for oneshot()

    use crate::backend::{BackendResolver, LaunchSettings};
    use crate::environment::EnvironmentCatalog;
    use crate::manager::ManagerSettings;
    use crate::session::SessionState;
    use crate::store::{MemoryStore, SessionRecord, SessionStore};

    fn create_state(store: Arc<MemoryStore>) -> AppState {
        AppState::new(SessionManager::new(
            BackendResolver::with_settings(LaunchSettings::default()),
            EnvironmentCatalog::default(),
            store,
            ManagerSettings::default(),
        ))
    }

    fn empty_state() -> AppState {
        create_state(Arc::new(MemoryStore::new()))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(empty_state(), RouterConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"], 0);
    }

    #[tokio::test]
    async fn test_health_is_public_when_token_set() {
        let config = RouterConfig {
            token: Some("secret".into()),
            ..Default::default()
        };
        let app = router(empty_state(), config);

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let sessions = app
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(sessions.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_create_invalid_working_dir() {
        let state = empty_state();
        let app = router(state.clone(), RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/sessions",
                serde_json::json!({"id": "s2", "workingDir": "/does/not/exist"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["code"], "invalid_working_directory");
        assert!(!state.manager.has_session("s2"));
    }

    #[tokio::test]
    async fn test_session_create_unknown_environment() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(empty_state(), RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/sessions",
                serde_json::json!({
                    "id": "s1",
                    "workingDir": dir.path(),
                    "environmentId": "gpu"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], "environment_not_found");
    }

    #[tokio::test]
    async fn test_session_create_rejects_bad_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(empty_state(), RouterConfig::default());

        let response = app
            .oneshot(post_json(
                "/sessions",
                serde_json::json!({"id": "a/b", "workingDir": dir.path()}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_get_missing_returns_404() {
        let app = router(empty_state(), RouterConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], "session_not_found");
    }

    #[tokio::test]
    async fn test_stored_session_is_listed_and_deletable() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(&SessionRecord {
                id: "old".into(),
                working_dir: "/tmp".into(),
                environment_id: "local".into(),
                resume_token: Some("abcd-1234".into()),
                session_state: SessionState::Paused,
                active_connections: 0,
                destroy_at: None,
                last_activity_at: 42,
                claude_options: Default::default(),
                env: Default::default(),
            })
            .unwrap();
        let app = router(create_state(store.clone()), RouterConfig::default());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json[0]["id"], "old");
        assert_eq!(json[0]["sessionState"], "PAUSED");
        assert_eq!(json[0]["resumeToken"], "abcd-1234");
        assert_eq!(json[0]["live"], false);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sessions/old")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            store.load("old").unwrap().unwrap().session_state,
            SessionState::Destroyed
        );
    }

    #[tokio::test]
    async fn test_pause_missing_returns_404() {
        let app = router(empty_state(), RouterConfig::default());
        let response = app
            .oneshot(post_json("/sessions/nope/pause", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_environment_list_has_local() {
        let app = router(empty_state(), RouterConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/environments").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert!(json
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["id"] == "local" && e["kind"] == "host"));
    }

    #[tokio::test]
    async fn test_environment_put_applies() {
        let state = empty_state();
        let app = router(state.clone(), RouterConfig::default());

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/environments/sandbox")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"kind":"docker","auth_dir":"/home/me/.claude","image":"custom"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["restarted"], serde_json::json!([]));
        let env = state.manager.environments().get("sandbox").unwrap();
        assert_eq!(env.image.as_deref(), Some("custom"));
    }

    #[tokio::test]
    async fn test_environment_put_docker_without_auth_dir() {
        let app = router(empty_state(), RouterConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/environments/sandbox")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"kind":"docker"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "invalid_environment");
    }

    #[tokio::test]
    async fn test_cors_layer_applied_when_configured() {
        let config = RouterConfig {
            token: None,
            cors_origins: vec!["http://localhost:3000".into()],
        };
        let app = router(empty_state(), config);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }
}
