// Client seam between the connection manager and a live upstream

use super::config::UpstreamConfig;
use super::http::HttpUpstream;
use super::stdio::StdioUpstream;
use crate::protocol::{ListToolsResult, ToolSchema, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{HubError, HubResult, UpstreamKind};

/// Pages past this are ignored when an upstream paginates `tools/list`.
const MAX_TOOL_PAGES: usize = 50;

/// A connected upstream MCP server
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Full `tools/list`, following pagination.
    async fn list_tools(&self) -> HubResult<Vec<ToolSchema>>;

    /// `tools/call`; the upstream's result is returned untouched.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value>;

    /// Why the connection is gone, if it is. `None` while it is usable.
    fn exit_reason(&self) -> Option<String>;

    /// Tear the connection down. Idempotent.
    async fn shutdown(&self);
}

/// Opens connections for upstream configs
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect and complete the MCP handshake.
    ///
    /// `env` is the fully merged environment for local processes.
    async fn connect(
        &self,
        config: &UpstreamConfig,
        env: HashMap<String, String>,
        init_timeout: Duration,
    ) -> HubResult<Arc<dyn UpstreamClient>>;
}

/// Connector for real stdio and HTTP upstreams
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for DefaultConnector {
    async fn connect(
        &self,
        config: &UpstreamConfig,
        env: HashMap<String, String>,
        init_timeout: Duration,
    ) -> HubResult<Arc<dyn UpstreamClient>> {
        match config.kind {
            UpstreamKind::LocalProcess => {
                let upstream = StdioUpstream::spawn(config, env, init_timeout).await?;
                Ok(Arc::new(upstream))
            }
            UpstreamKind::RemoteAggregator => {
                let upstream = HttpUpstream::connect(self.http.clone(), config, init_timeout).await?;
                Ok(Arc::new(upstream))
            }
            UpstreamKind::Internal => Err(HubError::Spawn {
                origin: config.id.clone(),
                reason: "internal tools have no connection".to_string(),
            }),
        }
    }
}

/// Params the hub sends in its own `initialize` request.
pub(crate) fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "switchboard",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Collect every page of `tools/list` using `request(params)`.
pub(crate) async fn list_all_pages<F, Fut>(origin: &str, mut request: F) -> HubResult<Vec<ToolSchema>>
where
    F: FnMut(Option<serde_json::Value>) -> Fut,
    Fut: Future<Output = HubResult<serde_json::Value>>,
{
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
        let raw = request(params).await?;
        let page: ListToolsResult = serde_json::from_value(raw)
            .map_err(|e| HubError::upstream(origin, format!("invalid tools/list result: {}", e)))?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(upstream = %origin, pages = MAX_TOOL_PAGES, "tools/list pagination cut short");
    Ok(tools)
}
