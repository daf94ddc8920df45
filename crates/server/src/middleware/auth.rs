use crate::api::ErrorResponse;
use crate::config::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Paths under this prefix are admin routes
const API_PREFIX: &str = "/api/";
const HEALTH_PATH: &str = "/api/health";

/// Extract the bearer token from the `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// Whether a request path needs the API token
pub fn requires_token(path: &str) -> bool {
    path.starts_with(API_PREFIX) && path != HEALTH_PATH
}

/// Compare without short-circuiting on the first differing byte
fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reject admin requests without the configured bearer token.
///
/// The hub transport and health check are always open; with no token
/// configured everything is.
pub async fn require_api_token(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    if !requires_token(req.uri().path()) {
        return next.run(req).await;
    }

    match bearer_token(req.headers()) {
        Some(given) if tokens_match(given, expected) => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "rejected API request with wrong token");
            unauthorized("Invalid API token")
        }
        None => unauthorized("Missing bearer token"),
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message))).into_response()
}
