use crate::config::AppState;
use crate::middleware::auth;
use crate::sse;
use anyhow::Result;
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use switchboard_core::HubError;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

pub use handlers::{CallToolRequest, ListSessionsResponse, ListToolsResponse, ListUpstreamsResponse, RefreshResponse};

/// Serve the hub and admin API until `shutdown` resolves
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

/// Create the HTTP router: hub transport under `/hub`, admin API under `/api`
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Hub transport
        .route("/hub/sse", get(sse::hub_stream))
        .route("/hub/messages", post(sse::post_message))
        // Admin API
        .route("/api/health", get(health_check))
        .route(
            "/api/upstreams",
            get(handlers::list_upstreams).post(handlers::add_upstream),
        )
        .route("/api/upstreams/{id}/start", post(handlers::start_upstream))
        .route("/api/upstreams/{id}/stop", post(handlers::stop_upstream))
        .route("/api/upstreams/{id}/refresh", post(handlers::refresh_upstream))
        .route("/api/tools", get(handlers::list_tools))
        .route("/api/tools/call", post(handlers::call_tool))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/events", get(sse::event_stream))
        // Middleware
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_token,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "switchboard",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: None,
            details: None,
        }
    }
}

/// Error type for API handlers, carrying the HTTP status to answer with
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: Option<&'static str>,
    error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            kind: None,
            error: error.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, anyhow::anyhow!(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let response = ErrorResponse {
            error: self.error.to_string(),
            kind: self.kind.map(String::from),
            details: (!details.is_empty()).then_some(details),
        };

        (self.status, Json(response)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let status = match &err {
            HubError::ToolNotFound { .. }
            | HubError::UpstreamNotFound { .. }
            | HubError::ResourceNotFound { .. }
            | HubError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            HubError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            HubError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            HubError::Upstream { .. } | HubError::Spawn { .. } => StatusCode::BAD_GATEWAY,
            HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: Some(err.kind()),
            error: err.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
