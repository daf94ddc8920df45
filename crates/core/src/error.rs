//! Error taxonomy shared by every hub component.
//!
//! Every variant is non-fatal to the hub: the protocol handler turns it into a
//! JSON-RPC error response for the one request that failed.

use serde_json::json;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    /// Tool name is not in the catalog (or not visible to the session).
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// An upstream's call or list operation failed.
    #[error("Upstream '{origin}' error: {message}")]
    Upstream { origin: String, message: String },

    /// An upstream call exceeded its timeout. The connection stays up.
    #[error("Upstream '{origin}' timed out after {timeout_ms}ms calling '{tool}'")]
    UpstreamTimeout {
        origin: String,
        tool: String,
        timeout_ms: u64,
    },

    /// An upstream process or connection could not be started.
    #[error("Failed to start upstream '{origin}': {reason}")]
    Spawn { origin: String, reason: String },

    /// No upstream with this id is known.
    #[error("Upstream not found: {id}")]
    UpstreamNotFound { id: String },

    /// No live session with this id.
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// Request is missing or has invalid params.
    #[error("Invalid params: {0}")]
    MalformedRequest(String),

    /// Prompt or resource does not exist.
    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn upstream(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::Upstream {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }

    /// JSON-RPC error code for this variant.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::MalformedRequest(_) => -32602,
            Self::Internal(_) => -32603,
            Self::ToolNotFound { .. } => -32001,
            Self::Upstream { .. } => -32002,
            Self::UpstreamTimeout { .. } => -32003,
            Self::Spawn { .. } => -32004,
            Self::UpstreamNotFound { .. } => -32005,
            Self::ResourceNotFound { .. } => -32006,
            Self::SessionNotFound { .. } => -32007,
        }
    }

    /// Machine-readable variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Spawn { .. } => "spawn_error",
            Self::UpstreamNotFound { .. } => "upstream_not_found",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::MalformedRequest(_) => "malformed_request",
            Self::ResourceNotFound { .. } => "resource_not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// The upstream this error is attributed to, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Upstream { origin, .. }
            | Self::UpstreamTimeout { origin, .. }
            | Self::Spawn { origin, .. } => Some(origin),
            Self::UpstreamNotFound { id } => Some(id),
            _ => None,
        }
    }

    /// Payload for the JSON-RPC `error.data` field.
    pub fn rpc_data(&self) -> serde_json::Value {
        match self.origin() {
            Some(origin) => json!({ "kind": self.kind(), "origin": origin }),
            None => json!({ "kind": self.kind() }),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            HubError::ToolNotFound { name: "x".into() },
            HubError::upstream("a", "boom"),
            HubError::UpstreamTimeout {
                origin: "a".into(),
                tool: "t".into(),
                timeout_ms: 10,
            },
            HubError::Spawn {
                origin: "a".into(),
                reason: "no such file".into(),
            },
            HubError::UpstreamNotFound { id: "a".into() },
            HubError::SessionNotFound { id: "s".into() },
            HubError::malformed("missing name"),
            HubError::ResourceNotFound { uri: "skill://x".into() },
            HubError::Internal("oops".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(HubError::rpc_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_rpc_data_carries_origin() {
        let err = HubError::upstream("github", "rate limited");
        assert_eq!(err.rpc_data()["origin"], "github");
        assert_eq!(err.rpc_data()["kind"], "upstream_error");
        assert!(HubError::ToolNotFound { name: "x".into() }
            .rpc_data()
            .get("origin")
            .is_none());
    }

    #[test]
    fn test_malformed_maps_to_invalid_params() {
        assert_eq!(HubError::malformed("x").rpc_code(), -32602);
    }
}
