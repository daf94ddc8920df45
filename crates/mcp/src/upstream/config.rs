// Upstream source configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use switchboard_core::{HubError, HubResult, UpstreamKind, INTERNAL_ORIGIN, NAMESPACE_SEPARATOR};

pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 30;

/// How to reach one upstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,
    pub kind: UpstreamKind,

    /// Executable for `local-process` upstreams
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,

    /// Endpoint for `remote-aggregator` upstreams
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl UpstreamConfig {
    pub fn local(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: UpstreamKind::LocalProcess,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            cwd: None,
            url: None,
            auth_token: None,
            enabled: true,
            call_timeout_secs: None,
        }
    }

    pub fn remote(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UpstreamKind::RemoteAggregator,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.into()),
            auth_token: None,
            enabled: true,
            call_timeout_secs: None,
        }
    }

    /// Check the config can be started. Ids end up as tool name prefixes.
    pub fn validate(&self) -> HubResult<()> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(HubError::malformed("upstream id must not be empty"));
        }
        if id != self.id || id.contains(NAMESPACE_SEPARATOR) || id.contains('/') {
            return Err(HubError::malformed(format!(
                "upstream id '{}' must not contain whitespace, '/' or '{}'",
                self.id, NAMESPACE_SEPARATOR
            )));
        }
        if id == INTERNAL_ORIGIN {
            return Err(HubError::malformed(format!("upstream id '{}' is reserved", INTERNAL_ORIGIN)));
        }

        match self.kind {
            UpstreamKind::LocalProcess => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(HubError::malformed(format!(
                        "upstream '{}' is local-process but has no command",
                        self.id
                    )));
                }
            }
            UpstreamKind::RemoteAggregator => {
                let raw = self.url.as_deref().unwrap_or_default();
                let parsed = url::Url::parse(raw).map_err(|e| {
                    HubError::malformed(format!("upstream '{}' has an invalid url '{}': {}", self.id, raw, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(HubError::malformed(format!(
                        "upstream '{}' url must be http or https",
                        self.id
                    )));
                }
            }
            UpstreamKind::Internal => {
                return Err(HubError::malformed("internal tools are not configured as upstreams"));
            }
        }
        Ok(())
    }
}

/// Timeouts applied by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    /// Bound on a single `tools/call` or `tools/list`
    pub call: Duration,
    /// Bound on spawn plus the `initialize` handshake and first `tools/list`
    pub init: Duration,
}

impl UpstreamTimeouts {
    /// Call timeout for one upstream, honouring its override.
    pub fn call_for(&self, config: &UpstreamConfig) -> Duration {
        config
            .call_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.call)
    }
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            init: Duration::from_secs(DEFAULT_INIT_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_local_and_remote() {
        assert!(UpstreamConfig::local("github", "npx", vec![]).validate().is_ok());
        assert!(UpstreamConfig::remote("docker", "http://localhost:9000/mcp").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        for id in ["", "a__b", "internal", " padded", "a/b"] {
            let config = UpstreamConfig::local(id, "npx", vec![]);
            assert!(config.validate().is_err(), "id {:?} should be rejected", id);
        }
    }

    #[test]
    fn test_validate_requires_transport_fields() {
        let mut local = UpstreamConfig::local("fs", "", vec![]);
        assert!(local.validate().is_err());
        local.command = None;
        assert!(local.validate().is_err());

        let remote = UpstreamConfig::remote("docker", "not a url");
        assert!(remote.validate().is_err());
        let remote = UpstreamConfig::remote("docker", "ftp://host/mcp");
        assert!(remote.validate().is_err());
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "id": "github",
            "kind": "local-process",
            "command": "github-mcp"
        }))
        .unwrap();
        assert!(config.enabled);
        assert!(config.args.is_empty());
        assert_eq!(config.call_timeout_secs, None);
    }

    #[test]
    fn test_call_timeout_override() {
        let timeouts = UpstreamTimeouts::default();
        let mut config = UpstreamConfig::local("slow", "slow-mcp", vec![]);
        assert_eq!(timeouts.call_for(&config), Duration::from_secs(30));
        config.call_timeout_secs = Some(120);
        assert_eq!(timeouts.call_for(&config), Duration::from_secs(120));
    }
}
