// Secret injection for upstream process environments

use std::collections::HashMap;

/// Source of environment variables injected into upstream processes at start.
///
/// The hub never persists these; they are read each time an upstream starts.
pub trait SecretSource: Send + Sync {
    fn env_vars(&self) -> HashMap<String, String>;
}

/// In-memory secret map
#[derive(Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Capture process environment variables whose names start with `prefix`.
    pub fn from_env_prefix(prefix: &str) -> Self {
        let values = std::env::vars()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Merge `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: StaticSecrets) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretSource for StaticSecrets {
    fn env_vars(&self) -> HashMap<String, String> {
        self.values.clone()
    }
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("StaticSecrets").field("keys", &keys).finish()
    }
}
