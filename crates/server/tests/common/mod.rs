// Shared fixtures for server integration tests
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::{HubError, HubResult};
use switchboard_mcp::protocol::ToolSchema;
use switchboard_mcp::upstream::{UpstreamClient, UpstreamConnector};
use switchboard_mcp::UpstreamConfig;
use switchboard_server::{AppState, ServerConfig};

pub fn tool(name: &str, description: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({"type": "object"}),
    }
}

/// In-process stand-in for a connected upstream
pub struct FakeUpstream {
    origin: String,
    tools: Vec<ToolSchema>,
    exit: Mutex<Option<String>>,
}

impl FakeUpstream {
    pub fn crash(&self, reason: &str) {
        *self.exit.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait::async_trait]
impl UpstreamClient for FakeUpstream {
    async fn list_tools(&self) -> HubResult<Vec<ToolSchema>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
        if let Some(reason) = self.exit.lock().unwrap().clone() {
            return Err(HubError::upstream(&self.origin, reason));
        }
        Ok(serde_json::json!({
            "content": [{"type": "text", "text": format!("{} handled {}", self.origin, name)}],
            "echo": arguments,
        }))
    }

    fn exit_reason(&self) -> Option<String> {
        self.exit.lock().unwrap().clone()
    }

    async fn shutdown(&self) {}
}

/// Connector serving fixed tool lists by upstream id
#[derive(Default)]
pub struct FakeConnector {
    tools: HashMap<String, Vec<ToolSchema>>,
    clients: Mutex<HashMap<String, Arc<FakeUpstream>>>,
    pub envs: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl FakeConnector {
    pub fn with_tools(upstreams: &[(&str, Vec<ToolSchema>)]) -> Arc<Self> {
        Arc::new(Self {
            tools: upstreams
                .iter()
                .map(|(id, tools)| (id.to_string(), tools.clone()))
                .collect(),
            ..Default::default()
        })
    }

    pub fn client(&self, id: &str) -> Arc<FakeUpstream> {
        Arc::clone(&self.clients.lock().unwrap()[id])
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(
        &self,
        config: &UpstreamConfig,
        env: HashMap<String, String>,
        _init_timeout: Duration,
    ) -> HubResult<Arc<dyn UpstreamClient>> {
        let tools = self.tools.get(&config.id).cloned().ok_or_else(|| HubError::Spawn {
            origin: config.id.clone(),
            reason: "no such fake upstream".to_string(),
        })?;
        let client = Arc::new(FakeUpstream {
            origin: config.id.clone(),
            tools,
            exit: Mutex::new(None),
        });
        self.clients.lock().unwrap().insert(config.id.clone(), Arc::clone(&client));
        self.envs.lock().unwrap().insert(config.id.clone(), env);
        Ok(client)
    }
}

pub const GITHUB_CONFIG: &str = r#"
[[upstreams]]
id = "github"
kind = "local-process"
command = "github-mcp"
"#;

pub fn github_tools() -> Vec<(&'static str, Vec<ToolSchema>)> {
    vec![(
        "github",
        vec![
            tool("create_issue", "Create a GitHub issue"),
            tool("list_prs", "List open pull requests"),
        ],
    )]
}

/// App state over fake upstreams, with every enabled upstream started
pub async fn started_state(toml: &str, upstreams: &[(&str, Vec<ToolSchema>)]) -> (AppState, Arc<FakeConnector>) {
    let config = ServerConfig::from_toml_str(toml).unwrap();
    let connector = FakeConnector::with_tools(upstreams);
    let state = AppState::with_connector(&config, Arc::clone(&connector) as Arc<dyn UpstreamConnector>).unwrap();
    for (id, result) in state.upstreams.start_enabled().await {
        result.unwrap_or_else(|e| panic!("{} failed to start: {}", id, e));
    }
    (state, connector)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn with_token(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );
    request
}

/// Collect a response body into a `serde_json::Value`.
pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read the next data frame of a streaming body as text.
pub async fn next_frame(body: &mut Body) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("timed out waiting for an SSE frame")
            .expect("stream ended")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            return String::from_utf8(data.to_vec()).unwrap();
        }
    }
}
