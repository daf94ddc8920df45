//! Upstream Connection Manager.
//!
//! Owns every live connection to an external tool provider. Other components
//! only reach an upstream through [`UpstreamManager::call_tool`] and read its
//! cached tool list through [`UpstreamManager::ready_tools`].
//!
//! A crashed upstream is marked `errored` and left alone: restarting is an
//! explicit operator action.

pub mod client;
pub mod config;
pub mod http;
pub mod stdio;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{DefaultConnector, UpstreamClient, UpstreamConnector};
pub use config::{UpstreamConfig, UpstreamTimeouts};

use crate::protocol::ToolSchema;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use switchboard_core::events::{EventBus, EventType};
use switchboard_core::secrets::SecretSource;
use switchboard_core::{ConnectionState, HubError, HubResult, UpstreamStatus};

struct UpstreamEntry {
    config: UpstreamConfig,
    state: ConnectionState,
    last_error: Option<String>,
    client: Option<Arc<dyn UpstreamClient>>,
    tools: Arc<Vec<ToolSchema>>,
    /// Bumped by every start/stop so a slow start cannot overwrite a newer one.
    generation: u64,
}

impl UpstreamEntry {
    fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            last_error: None,
            client: None,
            tools: Arc::new(Vec::new()),
            generation: 0,
        }
    }

    fn status(&self) -> UpstreamStatus {
        UpstreamStatus {
            id: self.config.id.clone(),
            kind: self.config.kind,
            state: self.state,
            last_error: self.last_error.clone(),
            tool_count: self.tools.len(),
        }
    }

    /// Drop the connection and cached tools. Returns the old client, if any.
    fn reset(&mut self, state: ConnectionState, last_error: Option<String>) -> Option<Arc<dyn UpstreamClient>> {
        self.generation += 1;
        self.state = state;
        self.last_error = last_error;
        self.tools = Arc::new(Vec::new());
        self.client.take()
    }
}

fn same_client(a: &Arc<dyn UpstreamClient>, b: &Arc<dyn UpstreamClient>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Upstream Connection Manager
pub struct UpstreamManager {
    entries: RwLock<BTreeMap<String, UpstreamEntry>>,
    connector: Arc<dyn UpstreamConnector>,
    secrets: Arc<dyn SecretSource>,
    timeouts: UpstreamTimeouts,
    /// Bumped whenever any upstream's tool list changes.
    revision: AtomicU64,
    events: EventBus,
}

impl UpstreamManager {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        secrets: Arc<dyn SecretSource>,
        timeouts: UpstreamTimeouts,
        events: EventBus,
    ) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            connector,
            secrets,
            timeouts,
            revision: AtomicU64::new(0),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, UpstreamEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, UpstreamEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_state(&self, id: &str, state: ConnectionState, last_error: Option<String>) {
        self.events.publish(EventType::UpstreamStateChanged {
            upstream_id: id.to_string(),
            state,
            last_error,
        });
    }

    /// Add or replace an upstream's config. A running connection keeps its
    /// old config until the next `start`.
    pub fn register(&self, config: UpstreamConfig) -> HubResult<()> {
        config.validate()?;
        let mut entries = self.write();
        match entries.get_mut(&config.id) {
            Some(entry) => entry.config = config,
            None => {
                tracing::debug!(upstream = %config.id, kind = %config.kind, "upstream registered");
                entries.insert(config.id.clone(), UpstreamEntry::new(config));
            }
        }
        Ok(())
    }

    /// Register `config` and connect to it.
    pub async fn start(&self, config: UpstreamConfig) -> HubResult<UpstreamStatus> {
        let id = config.id.clone();
        self.register(config)?;
        self.start_id(&id).await
    }

    /// Connect a registered upstream, replacing any live connection.
    ///
    /// Ready only after the first successful `tools/list`.
    pub async fn start_id(&self, id: &str) -> HubResult<UpstreamStatus> {
        let (config, generation, previous, had_tools) = {
            let mut entries = self.write();
            let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
            let had_tools = !entry.tools.is_empty();
            let previous = entry.reset(ConnectionState::Connecting, None);
            (entry.config.clone(), entry.generation, previous, had_tools)
        };
        if had_tools {
            self.bump_revision();
        }
        self.publish_state(id, ConnectionState::Connecting, None);

        if let Some(previous) = previous {
            tracing::info!(upstream = %id, "restarting upstream");
            previous.shutdown().await;
        }

        // Secrets win over the config's own env
        let mut env = config.env.clone();
        env.extend(self.secrets.env_vars());

        tracing::info!(upstream = %id, kind = %config.kind, "starting upstream");
        let connected = self.connect_and_list(&config, env).await;

        match connected {
            Ok((client, tools)) => {
                let status = {
                    let mut entries = self.write();
                    match entries.get_mut(id) {
                        Some(entry) if entry.generation == generation => {
                            entry.state = ConnectionState::Ready;
                            entry.client = Some(Arc::clone(&client));
                            entry.tools = Arc::new(tools);
                            Some(entry.status())
                        }
                        _ => None,
                    }
                };

                let Some(status) = status else {
                    client.shutdown().await;
                    return Err(HubError::Spawn {
                        origin: id.to_string(),
                        reason: "superseded by a later start or stop".to_string(),
                    });
                };

                self.bump_revision();
                self.publish_state(id, ConnectionState::Ready, None);
                tracing::info!(upstream = %id, tools = status.tool_count, "upstream ready");
                Ok(status)
            }
            Err(err) => {
                let reason = match &err {
                    HubError::Spawn { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                let current = {
                    let mut entries = self.write();
                    match entries.get_mut(id) {
                        Some(entry) if entry.generation == generation => {
                            entry.state = ConnectionState::Errored;
                            entry.last_error = Some(reason.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if current {
                    self.publish_state(id, ConnectionState::Errored, Some(reason.clone()));
                }
                tracing::warn!(upstream = %id, error = %reason, "upstream failed to start");
                Err(HubError::Spawn {
                    origin: id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn connect_and_list(
        &self,
        config: &UpstreamConfig,
        env: std::collections::HashMap<String, String>,
    ) -> HubResult<(Arc<dyn UpstreamClient>, Vec<ToolSchema>)> {
        let init = self.timeouts.init;
        let client = self.connector.connect(config, env, init).await?;

        let listed = tokio::time::timeout(init, client.list_tools()).await;
        match listed {
            Ok(Ok(tools)) => Ok((client, tools)),
            Ok(Err(e)) => {
                client.shutdown().await;
                Err(e)
            }
            Err(_) => {
                client.shutdown().await;
                Err(HubError::Spawn {
                    origin: config.id.clone(),
                    reason: format!("tools/list timed out after {:?}", init),
                })
            }
        }
    }

    /// Tear down the connection. Its tools leave the catalog immediately.
    pub async fn stop(&self, id: &str) -> HubResult<()> {
        let (client, had_tools, was) = {
            let mut entries = self.write();
            let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
            let had_tools = !entry.tools.is_empty();
            let was = entry.state;
            (entry.reset(ConnectionState::Disconnected, None), had_tools, was)
        };
        if had_tools {
            self.bump_revision();
        }
        if was != ConnectionState::Disconnected {
            self.publish_state(id, ConnectionState::Disconnected, None);
        }
        if let Some(client) = client {
            client.shutdown().await;
        }
        tracing::info!(upstream = %id, "upstream stopped");
        Ok(())
    }

    /// Re-query `tools/list` and replace the cached list wholesale.
    pub async fn refresh_tools(&self, id: &str) -> HubResult<Vec<ToolSchema>> {
        let (client, timeout) = self.ready_client(id)?;
        let listed = tokio::time::timeout(timeout, client.list_tools()).await;
        match listed {
            Ok(Ok(tools)) => {
                let replaced = {
                    let mut entries = self.write();
                    match entries.get_mut(id) {
                        Some(entry) if entry.client.as_ref().is_some_and(|c| same_client(c, &client)) => {
                            entry.tools = Arc::new(tools.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if replaced {
                    self.bump_revision();
                    tracing::info!(upstream = %id, tools = tools.len(), "tool list refreshed");
                }
                Ok(tools)
            }
            Ok(Err(e)) => {
                self.check_alive(id, &client);
                Err(e)
            }
            Err(_) => Err(HubError::UpstreamTimeout {
                origin: id.to_string(),
                tool: "tools/list".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Forward a call to a ready upstream, bounded by its call timeout.
    ///
    /// A timeout leaves the connection up. A failure on a dead connection
    /// marks the upstream errored.
    pub async fn call_tool(
        &self,
        id: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> HubResult<serde_json::Value> {
        let (client, timeout) = self.ready_client(id)?;
        let called = tokio::time::timeout(timeout, client.call_tool(tool, arguments)).await;
        match called {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.check_alive(id, &client);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(upstream = %id, tool = %tool, timeout = ?timeout, "upstream call timed out");
                Err(HubError::UpstreamTimeout {
                    origin: id.to_string(),
                    tool: tool.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn ready_client(&self, id: &str) -> HubResult<(Arc<dyn UpstreamClient>, Duration)> {
        let entries = self.read();
        let entry = entries.get(id).ok_or_else(|| not_found(id))?;
        match (&entry.client, entry.state) {
            (Some(client), ConnectionState::Ready) => {
                Ok((Arc::clone(client), self.timeouts.call_for(&entry.config)))
            }
            (_, state) => Err(HubError::upstream(id, format!("upstream is {}", state))),
        }
    }

    fn check_alive(&self, id: &str, client: &Arc<dyn UpstreamClient>) {
        if let Some(reason) = client.exit_reason() {
            self.mark_errored(id, client, reason);
        }
    }

    /// Mark `id` errored if `client` is still its live connection.
    fn mark_errored(&self, id: &str, client: &Arc<dyn UpstreamClient>, reason: String) -> bool {
        {
            let mut entries = self.write();
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            if !entry.client.as_ref().is_some_and(|c| same_client(c, client)) {
                return false;
            }
            entry.reset(ConnectionState::Errored, Some(reason.clone()));
        }
        self.bump_revision();
        tracing::warn!(upstream = %id, error = %reason, "upstream connection lost");
        self.publish_state(id, ConnectionState::Errored, Some(reason));
        true
    }

    /// Mark every ready upstream whose connection has died as errored.
    ///
    /// Returns the ids that changed. Nothing is restarted.
    pub fn reap_exited(&self) -> Vec<String> {
        let ready: Vec<(String, Arc<dyn UpstreamClient>)> = self
            .read()
            .iter()
            .filter(|(_, e)| e.state.is_ready())
            .filter_map(|(id, e)| e.client.as_ref().map(|c| (id.clone(), Arc::clone(c))))
            .collect();

        ready
            .into_iter()
            .filter_map(|(id, client)| {
                let reason = client.exit_reason()?;
                self.mark_errored(&id, &client, reason).then_some(id)
            })
            .collect()
    }

    /// Start every registered upstream with `enabled = true`, concurrently.
    pub async fn start_enabled(&self) -> Vec<(String, HubResult<UpstreamStatus>)> {
        let ids: Vec<String> = self
            .read()
            .values()
            .filter(|e| e.config.enabled && e.client.is_none())
            .map(|e| e.config.id.clone())
            .collect();

        let results = futures::future::join_all(ids.iter().map(|id| self.start_id(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Stop every connection, e.g. on hub shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, e)| e.client.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Cached tool lists of every ready upstream, ordered by upstream id.
    pub fn ready_tools(&self) -> Vec<(String, Arc<Vec<ToolSchema>>)> {
        self.read()
            .iter()
            .filter(|(_, e)| e.state.is_ready())
            .map(|(id, e)| (id.clone(), Arc::clone(&e.tools)))
            .collect()
    }

    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        self.read().values().map(UpstreamEntry::status).collect()
    }

    pub fn status(&self, id: &str) -> HubResult<UpstreamStatus> {
        self.read().get(id).map(UpstreamEntry::status).ok_or_else(|| not_found(id))
    }

    pub fn config(&self, id: &str) -> Option<UpstreamConfig> {
        self.read().get(id).map(|e| e.config.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Changes whenever the set of ready tools may have changed.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

fn not_found(id: &str) -> HubError {
    HubError::UpstreamNotFound { id: id.to_string() }
}
