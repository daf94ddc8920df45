use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_core::session::SessionSummary;
use switchboard_core::{ToolDefinition, UpstreamStatus};
use switchboard_mcp::UpstreamConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ListUpstreamsResponse {
    pub upstreams: Vec<UpstreamStatus>,
}

/// Status of every tool source, `internal` first
pub async fn list_upstreams(State(state): State<Arc<AppState>>) -> Json<ListUpstreamsResponse> {
    Json(ListUpstreamsResponse {
        upstreams: state.router.statuses(),
    })
}

/// Register an upstream and connect to it
pub async fn add_upstream(
    State(state): State<Arc<AppState>>,
    Json(config): Json<UpstreamConfig>,
) -> ApiResult<(StatusCode, Json<UpstreamStatus>)> {
    tracing::info!(upstream = %config.id, kind = %config.kind, "upstream added via API");
    let status = state.upstreams.start(config).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn start_upstream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<UpstreamStatus>> {
    let status = state.upstreams.start_id(&id).await?;
    Ok(Json(status))
}

pub async fn stop_upstream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<UpstreamStatus>> {
    state.upstreams.stop(&id).await?;
    Ok(Json(state.upstreams.status(&id)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub id: String,
    pub tool_count: usize,
    pub tools: Vec<String>,
}

/// Re-list an upstream's tools
pub async fn refresh_upstream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RefreshResponse>> {
    let tools = state.upstreams.refresh_tools(&id).await?;
    Ok(Json(RefreshResponse {
        id,
        tool_count: tools.len(),
        tools: tools.into_iter().map(|t| t.name).collect(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListToolsResponse {
    pub count: usize,
    pub tools: Vec<ToolDefinition>,
}

/// The full catalog, regardless of any session's visible set
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ListToolsResponse> {
    let tools = state.router.list_all_tools();
    Json(ListToolsResponse {
        count: tools.len(),
        tools,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::json!({})
}

/// Inspector call straight through the router
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallToolRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("Tool name is required"));
    }
    tracing::info!(tool = %req.name, "inspector tool call");
    let result = state.router.call_tool(&req.name, req.arguments).await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<ListSessionsResponse> {
    let sessions = state.hub.sessions().list();
    Json(ListSessionsResponse {
        count: sessions.len(),
        sessions,
    })
}
