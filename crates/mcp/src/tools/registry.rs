// Internal tool registry: tools implemented inside the hub process

use crate::protocol::ToolSchema;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchboard_core::{HubError, ToolDefinition, INTERNAL_ORIGIN};

/// Failure of an internal tool handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

impl From<ToolError> for HubError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments(msg) => HubError::MalformedRequest(msg),
            ToolError::Failed(msg) => HubError::upstream(INTERNAL_ORIGIN, msg),
        }
    }
}

/// Handler for one internal tool
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool schema for MCP
    fn definition(&self) -> ToolSchema;

    /// Run the tool with the given arguments
    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Listed in every session without a `load_tool`
    fn always_visible(&self) -> bool {
        false
    }
}

type HandlerFn =
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ToolError>> + Send + Sync;

/// Adapter so plain async closures can be registered as tools.
struct FnTool {
    schema: ToolSchema,
    handler: Box<HandlerFn>,
}

#[async_trait::async_trait]
impl ToolHandler for FnTool {
    fn definition(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        (self.handler)(arguments).await
    }
}

/// Registry of internal tools, keyed by bare tool name
#[derive(Default)]
pub struct InternalToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
    always_visible: Vec<String>,
}

impl InternalToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        let name = tool.definition().name;
        if tool.always_visible() && !self.always_visible.contains(&name) {
            self.always_visible.push(name.clone());
        }
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "internal tool registered twice, keeping the latest");
        }
    }

    /// Register an async closure as a tool.
    pub fn register_fn<F, Fut>(&mut self, schema: ToolSchema, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
    {
        self.register(Arc::new(FnTool {
            schema,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }));
    }

    /// Mark an already-registered tool as always visible.
    pub fn mark_always_visible(&mut self, name: &str) -> bool {
        if !self.tools.contains_key(name) {
            return false;
        }
        if !self.always_visible.iter().any(|n| n == name) {
            self.always_visible.push(name.to_string());
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Catalog definitions, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| {
                let schema = tool.definition();
                ToolDefinition::new(schema.name, schema.description, schema.input_schema, INTERNAL_ORIGIN)
            })
            .collect()
    }

    pub fn always_visible(&self) -> &[String] {
        &self.always_visible
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_integer(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "integer",
        "description": description
    })
}

pub fn json_schema_array(items: serde_json::Value, description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "array",
        "items": items,
        "description": description
    })
}
