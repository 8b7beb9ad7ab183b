//! Bearer-token authentication middleware.
//!
//! Keys are read once at startup from the `GAMEFORGE_API_KEYS` environment
//! variable (comma-separated). An empty key set disables authentication,
//! which is logged loudly at startup.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::error::ApiError;

pub const API_KEYS_ENV: &str = "GAMEFORGE_API_KEYS";

/// Parse a comma-separated key list, dropping empty entries.
pub fn parse_api_keys(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load the key set from the environment.
pub fn api_keys_from_env() -> HashSet<String> {
    let keys = std::env::var(API_KEYS_ENV)
        .map(|raw| parse_api_keys(&raw))
        .unwrap_or_default();
    if keys.is_empty() {
        tracing::warn!("no API keys configured; authentication is disabled");
    }
    keys
}

/// Reject requests lacking a valid `Authorization: Bearer <key>` header.
///
/// A request with no matching key gets 401 without reaching the handler.
pub async fn require_api_key(
    State(keys): State<Arc<HashSet<String>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if keys.is_empty() {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| keys.contains(token));

    if authorized {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn handler() -> &'static str {
        "OK"
    }

    fn app(keys: HashSet<String>) -> Router {
        Router::new().route("/test", get(handler)).layer(
            axum::middleware::from_fn_with_state(Arc::new(keys), require_api_key),
        )
    }

    #[test]
    fn parses_comma_separated_keys() {
        let keys = parse_api_keys("alpha, beta ,,gamma");
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("alpha"));
        assert!(keys.contains("beta"));
        assert!(keys.contains("gamma"));
    }

    #[tokio::test]
    async fn empty_key_set_disables_auth() {
        let req = Request::get("/test").body(Body::empty()).unwrap();
        let resp = app(HashSet::new()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_bearer_token_is_accepted() {
        let req = Request::get("/test")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = app(parse_api_keys("secret")).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let req = Request::get("/test").body(Body::empty()).unwrap();
        let resp = app(parse_api_keys("secret")).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let req = Request::get("/test")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let resp = app(parse_api_keys("secret")).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
