// In-memory upstreams for manager, router and hub tests

use super::client::{UpstreamClient, UpstreamConnector};
use super::config::UpstreamConfig;
use crate::protocol::ToolSchema;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::{HubError, HubResult};

pub(crate) fn tool(name: &str, description: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({"type": "object", "properties": {}}),
    }
}

#[derive(Default)]
pub(crate) struct MockClient {
    pub tools: Mutex<Vec<ToolSchema>>,
    pub exit: Mutex<Option<String>>,
    pub call_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
    pub shutdowns: AtomicUsize,
    origin: String,
}

impl MockClient {
    pub fn new(origin: &str, tools: Vec<ToolSchema>) -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(tools),
            origin: origin.to_string(),
            ..Default::default()
        })
    }

    pub fn crash(&self, reason: &str) {
        *self.exit.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait::async_trait]
impl UpstreamClient for MockClient {
    async fn list_tools(&self) -> HubResult<Vec<ToolSchema>> {
        if let Some(reason) = self.exit.lock().unwrap().clone() {
            return Err(HubError::upstream(&self.origin, reason));
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
        if let Some(reason) = self.exit.lock().unwrap().clone() {
            return Err(HubError::upstream(&self.origin, format!("connection closed: {}", reason)));
        }
        self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(serde_json::json!({
            "content": [{"type": "text", "text": format!("{} handled {}", self.origin, name)}],
            "echo": arguments,
        }))
    }

    fn exit_reason(&self) -> Option<String> {
        self.exit.lock().unwrap().clone()
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`MockClient`] per connect, built from registered tool lists.
#[derive(Default)]
pub(crate) struct MockConnector {
    pub tools: Mutex<HashMap<String, Vec<ToolSchema>>>,
    pub failures: Mutex<HashMap<String, String>>,
    pub clients: Mutex<HashMap<String, Arc<MockClient>>>,
    pub envs: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MockConnector {
    pub fn with_tools(upstreams: &[(&str, Vec<ToolSchema>)]) -> Arc<Self> {
        let connector = Self::default();
        {
            let mut tools = connector.tools.lock().unwrap();
            for (id, list) in upstreams {
                tools.insert(id.to_string(), list.clone());
            }
        }
        Arc::new(connector)
    }

    pub fn fail(&self, id: &str, reason: &str) {
        self.failures.lock().unwrap().insert(id.to_string(), reason.to_string());
    }

    pub fn client(&self, id: &str) -> Arc<MockClient> {
        self.clients.lock().unwrap()[id].clone()
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(
        &self,
        config: &UpstreamConfig,
        env: HashMap<String, String>,
        _init_timeout: Duration,
    ) -> HubResult<Arc<dyn UpstreamClient>> {
        self.envs.lock().unwrap().insert(config.id.clone(), env);
        if let Some(reason) = self.failures.lock().unwrap().get(&config.id).cloned() {
            return Err(HubError::Spawn {
                origin: config.id.clone(),
                reason,
            });
        }
        let tools = self.tools.lock().unwrap().get(&config.id).cloned().unwrap_or_default();
        let client = MockClient::new(&config.id, tools);
        self.clients.lock().unwrap().insert(config.id.clone(), Arc::clone(&client));
        Ok(client)
    }
}
