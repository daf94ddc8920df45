use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Origin id used for tools implemented inside the hub process.
pub const INTERNAL_ORIGIN: &str = "internal";

/// Separator between an upstream id and its tool name in the merged catalog.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Unique identifier for a client session (one live connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tool as exposed in the aggregated catalog.
///
/// Immutable once registered. When an upstream's tool list changes the
/// whole list for that origin is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(rename = "originId")]
    pub origin_id: String,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            origin_id: origin_id.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.origin_id == INTERNAL_ORIGIN
    }

    /// Wire shape for MCP `tools/list`, without routing metadata.
    pub fn to_mcp_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Build the catalog name of an upstream tool.
pub fn namespaced_tool_name(origin_id: &str, tool_name: &str) -> String {
    format!("{}{}{}", origin_id, NAMESPACE_SEPARATOR, tool_name)
}

/// Kind of tool-providing source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamKind {
    /// Child process speaking MCP over stdio
    LocalProcess,
    /// Remote MCP aggregator reached over HTTP
    RemoteAggregator,
    /// Tools implemented in-process
    Internal,
}

impl std::fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LocalProcess => "local-process",
            Self::RemoteAggregator => "remote-aggregator",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle of an upstream source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Errored,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Snapshot of one upstream source, as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub id: String,
    pub kind: UpstreamKind,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tool_count: usize,
}
