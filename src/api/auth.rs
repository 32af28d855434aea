use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Auth middleware: every request, websocket upgrades included, must carry
/// `Authorization: Bearer <token>`.
pub async fn require_auth(
    expected_token: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(&req) {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) => {
            Ok(next.run(req).await)
        }
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(token: String) -> Router {
        Router::new()
            .route("/test", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                async move { require_auth(t, req, next).await }
            }))
    }

    async fn status_for(req: Request<Body>) -> StatusCode {
        test_app("secret".to_string())
            .oneshot(req)
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn extract_bearer_with_header() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer my-secret-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("my-secret-token"));
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), None);
    }

    #[tokio::test]
    async fn valid_token_passes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_returns_401() {
        let req = Request::builder().uri("/test").body(Body::empty()).unwrap();
        assert_eq!(status_for(req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_403() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer wrong-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn query_token_not_accepted() {
        let req = Request::builder()
            .uri("/test?token=secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn websocket_upgrade_needs_header_too() {
        let req = Request::builder()
            .uri("/test")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(req).await, StatusCode::UNAUTHORIZED);
    }
}
