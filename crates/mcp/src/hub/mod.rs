//! Hub Protocol Handler.
//!
//! Speaks MCP JSON-RPC for one message at a time. All state lives in the
//! [`SessionStore`] and behind the [`AggregationRouter`]; a failed request
//! becomes a JSON-RPC error and never takes the session down.

pub mod agent;
pub mod meta;
pub mod script;

use crate::protocol::{
    CallToolParams, CallToolResult, GetPromptParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ListChangedCapability, ReadResourceParams, ServerCapabilities, ServerInfo,
    JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::router::AggregationRouter;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::library::Library;
use switchboard_core::session::{SessionGuard, SessionStore, DEFAULT_VISIBLE_CAPACITY};
use switchboard_core::{HubError, HubResult, SessionId};
use tokio::sync::mpsc;

const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

const INSTRUCTIONS: &str = "This hub exposes a small set of tools by default. \
Call search_tools to find more, then load_tool to make one callable in this session.";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Max tools in a session's visible set
    pub visible_capacity: usize,
    /// Reject `tools/call` on catalog tools the session has not loaded
    pub strict_visibility: bool,
    /// Internal tools listed in every session
    pub always_visible: Vec<String>,
    pub agent_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            visible_capacity: DEFAULT_VISIBLE_CAPACITY,
            strict_visibility: true,
            always_visible: Vec::new(),
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

pub struct HubHandler {
    router: Arc<AggregationRouter>,
    sessions: Arc<SessionStore>,
    library: Arc<Library>,
    config: HubConfig,
    always_visible: Vec<String>,
}

impl HubHandler {
    pub fn new(router: Arc<AggregationRouter>, library: Arc<Library>, config: HubConfig) -> Self {
        let mut always_visible: Vec<String> = router.internal().always_visible().to_vec();
        for name in &config.always_visible {
            if !router.internal().contains(name) {
                tracing::warn!(tool = %name, "always_visible names an unknown internal tool");
                continue;
            }
            if !always_visible.contains(name) {
                always_visible.push(name.clone());
            }
        }

        Self {
            sessions: SessionStore::new(config.visible_capacity),
            router,
            library,
            config,
            always_visible,
        }
    }

    /// Open a session; it lives until the guard is dropped.
    pub fn open_session(&self, notifier: Option<mpsc::UnboundedSender<serde_json::Value>>) -> SessionGuard {
        self.sessions.open(notifier)
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<AggregationRouter> {
        &self.router
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// Handle one raw JSON-RPC message. `None` for notifications.
    pub async fn handle_str(&self, session: &SessionId, raw: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(message) => self.handle(session, message).await,
            Err(e) => {
                tracing::debug!(session = %session, error = %e, "unparseable JSON-RPC message");
                Some(JsonRpcResponse::error(serde_json::Value::Null, JsonRpcError::parse_error()))
            }
        }
    }

    /// Handle one decoded JSON-RPC message. `None` for notifications and
    /// for stray responses from the client.
    pub async fn handle(&self, session: &SessionId, message: serde_json::Value) -> Option<JsonRpcResponse> {
        let id = message.get("id").cloned();
        let is_response = message.get("method").is_none()
            && (message.get("result").is_some() || message.get("error").is_some());
        if is_response {
            tracing::debug!(session = %session, "ignoring response sent by client");
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(_) => {
                return Some(JsonRpcResponse::error(
                    id.unwrap_or(serde_json::Value::Null),
                    JsonRpcError::invalid_request(),
                ))
            }
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                request.id.unwrap_or(serde_json::Value::Null),
                JsonRpcError::invalid_request(),
            ));
        }

        let Some(id) = request.id else {
            self.handle_notification(session, &request.method);
            return None;
        };

        let method = request.method;
        let params = request.params.unwrap_or(serde_json::Value::Null);
        let outcome = AssertUnwindSafe(self.dispatch(session, &method, params))
            .catch_unwind()
            .await;

        Some(match outcome {
            Ok(Ok(result)) => JsonRpcResponse::success(id, result),
            Ok(Err(error)) => {
                tracing::debug!(session = %session, method = %method, code = error.code, error = %error.message, "request failed");
                JsonRpcResponse::error(id, error)
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(session = %session, method = %method, panic = %detail, "handler panicked");
                JsonRpcResponse::error(id, JsonRpcError::internal_error(format!("Internal error: {}", detail)))
            }
        })
    }

    fn handle_notification(&self, session: &SessionId, method: &str) {
        match method {
            "notifications/initialized" => tracing::debug!(session = %session, "client initialized"),
            "notifications/cancelled" => tracing::debug!(session = %session, "client cancelled a request"),
            other => tracing::debug!(session = %session, method = %other, "unhandled notification"),
        }
    }

    async fn dispatch(
        &self,
        session: &SessionId,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, JsonRpcError> {
        let result = match method {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.list_tools(session),
            "tools/call" => {
                let call: CallToolParams = parse_params(params)?;
                self.call_tool(session, &call.name, call.arguments).await
            }
            "prompts/list" => Ok(self.list_prompts()),
            "prompts/get" => {
                let get: GetPromptParams = parse_params(params)?;
                self.get_prompt(&get.name)
            }
            "resources/list" => Ok(serde_json::json!({ "resources": self.library.resources() })),
            "resources/read" => {
                let read: ReadResourceParams = parse_params(params)?;
                self.library
                    .read_resource(&read.uri)
                    .map(|content| serde_json::json!({ "contents": [content] }))
            }
            _ => return Err(JsonRpcError::method_not_found()),
        };
        result.map_err(JsonRpcError::from)
    }

    fn initialize(&self) -> serde_json::Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                prompts: Some(ListChangedCapability { list_changed: false }),
                resources: Some(ListChangedCapability { list_changed: false }),
            },
            server_info: ServerInfo {
                name: "switchboard".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        };
        serde_json::to_value(result).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Meta-tools, then always-visible tools, then the session's loaded
    /// tools in load order. Loaded names that no longer resolve are omitted.
    pub fn list_tools(&self, session: &SessionId) -> HubResult<serde_json::Value> {
        let visible = self.sessions.visible(session)?;
        let catalog = self.router.catalog();

        let mut tools: Vec<serde_json::Value> = meta::definitions()
            .into_iter()
            .map(|schema| serde_json::to_value(schema).unwrap_or_default())
            .collect();

        let mut listed: Vec<&str> = Vec::new();
        for name in self.always_visible.iter().chain(visible.iter()) {
            if listed.contains(&name.as_str()) {
                continue;
            }
            if let Some(entry) = catalog.get(name) {
                tools.push(entry.definition.to_mcp_json());
                listed.push(name.as_str());
            }
        }

        Ok(serde_json::json!({ "tools": tools }))
    }

    /// `tools/call` with meta-tool dispatch and visibility gating.
    pub async fn call_tool(
        &self,
        session: &SessionId,
        name: &str,
        arguments: serde_json::Value,
    ) -> HubResult<serde_json::Value> {
        let value = match name {
            meta::SEARCH_TOOLS => meta::search_tools(&self.router, &self.sessions, session, arguments)?,
            meta::LOAD_TOOL => meta::load_tool(&self.router, &self.sessions, &self.always_visible, session, arguments)?,
            meta::RUN_CODE | meta::EXECUTE_CODE => script::run_code(&self.router, arguments).await?,
            meta::RUN_AGENT => agent::run_agent(&self.library, arguments, self.config.agent_timeout).await?,
            _ => {
                if !self.is_callable(session, name)? {
                    return Err(HubError::ToolNotFound { name: name.to_string() });
                }
                self.router.call_tool(name, arguments).await?
            }
        };
        Ok(into_tool_result(value))
    }

    fn is_callable(&self, session: &SessionId, name: &str) -> HubResult<bool> {
        if !self.config.strict_visibility || self.always_visible.iter().any(|n| n == name) {
            // Session must still exist
            self.sessions.visible(session)?;
            return Ok(true);
        }
        self.sessions.is_visible(session, name)
    }

    fn list_prompts(&self) -> serde_json::Value {
        let prompts: Vec<serde_json::Value> = self
            .library
            .prompts()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "description": p.description,
                    "arguments": [],
                })
            })
            .collect();
        serde_json::json!({ "prompts": prompts })
    }

    fn get_prompt(&self, name: &str) -> HubResult<serde_json::Value> {
        let prompt = self.library.prompt(name).ok_or_else(|| HubError::ResourceNotFound {
            uri: format!("prompt://{}", name),
        })?;
        Ok(serde_json::json!({
            "description": prompt.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": prompt.content },
            }],
        }))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

/// Upstream results that already carry `content` pass through verbatim;
/// anything else is wrapped as text.
fn into_tool_result(value: serde_json::Value) -> serde_json::Value {
    if value.get("content").is_some_and(|c| c.is_array()) {
        return value;
    }
    match value {
        serde_json::Value::String(text) => CallToolResult::text(text).into_value(),
        other => CallToolResult::json(&other).into_value(),
    }
}
