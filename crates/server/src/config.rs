use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::events::EventBus;
use switchboard_core::library::{AgentDef, Library, LibraryKind, PromptDef, SkillDef};
use switchboard_core::secrets::StaticSecrets;
use switchboard_core::session::DEFAULT_VISIBLE_CAPACITY;
use switchboard_core::HubError;
use switchboard_mcp::tools::{register_memory_tools, CommandSpec, CommandTool, InternalToolRegistry, MemoryStore};
use switchboard_mcp::upstream::config::{DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_INIT_TIMEOUT_SECS};
use switchboard_mcp::upstream::{DefaultConnector, UpstreamConnector, UpstreamTimeouts};
use switchboard_mcp::{AggregationRouter, HubConfig, HubHandler, UpstreamConfig, UpstreamManager};

pub const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid upstream '{id}': {source}")]
    Upstream {
        id: String,
        #[source]
        source: HubError,
    },

    #[error("library directory {}: {source}", path.display())]
    LibraryDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory relative paths in the file resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub upstream_defaults: UpstreamDefaults,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    #[serde(default)]
    pub hooks: Vec<HookConfig>,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_visible_capacity")]
    pub visible_capacity: usize,
    #[serde(default = "default_true")]
    pub strict_visibility: bool,
    #[serde(default)]
    pub always_visible: Vec<String>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Bearer token required on `/api/*` (except health) when set
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_visible_capacity() -> usize {
    DEFAULT_VISIBLE_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    15
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            visible_capacity: default_visible_capacity(),
            strict_visibility: true,
            always_visible: Vec::new(),
            keepalive_secs: default_keepalive_secs(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamDefaults {
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_init_timeout() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}

impl Default for UpstreamDefaults {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            init_timeout_secs: default_init_timeout(),
        }
    }
}

/// Tool-call events a hook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreToolCall,
    PostToolCall,
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreToolCall => "pre_tool_call",
            Self::PostToolCall => "post_tool_call",
        }
    }
}

/// A command run on every matching event, with the event JSON on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub event: HookEvent,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub prompts: Vec<PromptDef>,
    #[serde(default)]
    pub skills: Vec<SkillDef>,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
    #[serde(default)]
    pub agents_dir: Option<PathBuf>,
}

impl LibraryConfig {
    /// Inline definitions first, then directory scans; inline entries win.
    pub fn build(&self, base_dir: &Path) -> Result<Library, ConfigError> {
        let mut library = Library::new();
        for prompt in &self.prompts {
            library.add_prompt(prompt.clone());
        }
        for skill in &self.skills {
            library.add_skill(skill.clone());
        }
        for agent in &self.agents {
            library.add_agent(agent.clone());
        }

        let dirs = [
            (&self.prompts_dir, LibraryKind::Prompts),
            (&self.skills_dir, LibraryKind::Skills),
            (&self.agents_dir, LibraryKind::Agents),
        ];
        for (dir, kind) in dirs {
            let Some(dir) = dir else { continue };
            let path = resolve(base_dir, dir);
            library
                .load_dir(&path, kind)
                .map_err(|source| ConfigError::LibraryDir { path, source })?;
        }
        Ok(library)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// TOML file of `KEY = "value"` pairs
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Copy process env vars with this prefix
    #[serde(default)]
    pub env_prefix: Option<String>,
}

impl SecretsConfig {
    /// Values from the file override values copied from the environment.
    pub fn load(&self, base_dir: &Path) -> Result<StaticSecrets, ConfigError> {
        let mut secrets = match &self.env_prefix {
            Some(prefix) => StaticSecrets::from_env_prefix(prefix),
            None => StaticSecrets::new(),
        };

        if let Some(file) = &self.file {
            let path = resolve(base_dir, file);
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let values: HashMap<String, String> =
                toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
            secrets.merge(StaticSecrets::from_map(values));
        }

        Ok(secrets)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

impl ServerConfig {
    /// Load from `path`, or fall back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if !path.exists() {
            tracing::info!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self {
                base_dir,
                ..Default::default()
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate().map_err(|source| ConfigError::Upstream {
                id: upstream.id.clone(),
                source,
            })?;
            if !ids.insert(upstream.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate upstream id '{}'", upstream.id)));
            }
        }

        for command in &self.commands {
            if command.name.trim().is_empty() || command.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "every [[commands]] entry needs a name and a command".to_string(),
                ));
            }
        }

        for hook in &self.hooks {
            if hook.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} hook has an empty command",
                    hook.event.name()
                )));
            }
        }

        if self.hub.visible_capacity == 0 {
            return Err(ConfigError::Invalid("hub.visible_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> UpstreamTimeouts {
        UpstreamTimeouts {
            call: Duration::from_secs(self.upstream_defaults.call_timeout_secs),
            init: Duration::from_secs(self.upstream_defaults.init_timeout_secs),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            visible_capacity: self.hub.visible_capacity,
            strict_visibility: self.hub.strict_visibility,
            always_visible: self.hub.always_visible.clone(),
            agent_timeout: Duration::from_secs(self.upstream_defaults.call_timeout_secs),
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.hub.keepalive_secs.max(1))
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubHandler>,
    pub router: Arc<AggregationRouter>,
    pub upstreams: Arc<UpstreamManager>,
    pub events: EventBus,
    pub hooks: Vec<HookConfig>,
    pub api_token: Option<String>,
    pub keepalive: Duration,
    pub call_timeout: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        Self::with_connector(config, Arc::new(DefaultConnector::new()))
    }

    /// Wire the hub with a custom way of reaching upstreams.
    pub fn with_connector(config: &ServerConfig, connector: Arc<dyn UpstreamConnector>) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let timeouts = config.timeouts();

        let secrets = config
            .secrets
            .load(&config.base_dir)
            .context("Failed to load secrets")?;
        if !secrets.is_empty() {
            tracing::info!(count = secrets.len(), "secrets loaded for upstream environments");
        }

        let upstreams = Arc::new(UpstreamManager::new(
            connector,
            Arc::new(secrets),
            timeouts,
            events.clone(),
        ));
        for upstream in &config.upstreams {
            upstreams
                .register(upstream.clone())
                .with_context(|| format!("Failed to register upstream '{}'", upstream.id))?;
        }

        let mut registry = InternalToolRegistry::new();
        register_memory_tools(&mut registry, Arc::new(MemoryStore::default()));
        for command in &config.commands {
            registry.register(Arc::new(CommandTool::new(command.clone(), timeouts.call)));
        }

        let library = config
            .library
            .build(&config.base_dir)
            .context("Failed to load prompt library")?;

        let router = Arc::new(AggregationRouter::new(Arc::new(registry), Arc::clone(&upstreams)));
        let hub = Arc::new(HubHandler::new(
            Arc::clone(&router),
            Arc::new(library),
            config.hub_config(),
        ));

        Ok(Self {
            hub,
            router,
            upstreams,
            events,
            hooks: config.hooks.clone(),
            api_token: config.hub.api_token.clone().filter(|t| !t.is_empty()),
            keepalive: config.keepalive(),
            call_timeout: timeouts.call,
        })
    }
}
