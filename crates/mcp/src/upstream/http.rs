// Remote-aggregator upstreams: JSON-RPC over HTTP POST (streamable HTTP)

use super::client::{initialize_params, list_all_pages, UpstreamClient};
use super::config::UpstreamConfig;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, ToolSchema};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use switchboard_core::{HubError, HubResult};

const SESSION_HEADER: &str = "mcp-session-id";
const MAX_ERROR_BODY_CHARS: usize = 500;

/// MCP server reached over HTTP, typically a Dockerized aggregator
pub struct HttpUpstream {
    origin: String,
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpUpstream {
    /// Connect and complete the `initialize` handshake within `init_timeout`.
    pub async fn connect(
        client: reqwest::Client,
        config: &UpstreamConfig,
        init_timeout: Duration,
    ) -> HubResult<Self> {
        let url = config.url.clone().ok_or_else(|| HubError::Spawn {
            origin: config.id.clone(),
            reason: "no url configured".to_string(),
        })?;

        let upstream = Self {
            origin: config.id.clone(),
            client,
            url,
            auth_token: config.auth_token.clone(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };

        let outcome = tokio::time::timeout(init_timeout, upstream.handshake()).await;
        match outcome {
            Ok(Ok(())) => {
                tracing::info!(upstream = %upstream.origin, url = %upstream.url, "connected to remote aggregator");
                Ok(upstream)
            }
            Ok(Err(e)) => Err(HubError::Spawn {
                origin: upstream.origin.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(HubError::Spawn {
                origin: upstream.origin.clone(),
                reason: format!("initialize timed out after {:?}", init_timeout),
            }),
        }
    }

    async fn handshake(&self) -> HubResult<()> {
        self.request("initialize", Some(initialize_params())).await?;
        self.notify("notifications/initialized").await
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn post(&self, body: &JsonRpcRequest) -> HubResult<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        if let Some(sid) = self.session_id() {
            req = req.header(SESSION_HEADER, sid);
        }

        let response = req
            .send()
            .await
            .map_err(|e| HubError::upstream(&self.origin, format!("HTTP request failed: {}", e)))?;

        if let Some(sid) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(sid.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::upstream(
                &self.origin,
                format!("HTTP {}: {}", status, truncate_chars(&body, MAX_ERROR_BODY_CHARS)),
            ));
        }
        Ok(response)
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> HubResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| HubError::upstream(&self.origin, format!("failed to read response: {}", e)))?;

        let rpc = if is_stream {
            response_from_event_stream(&body, id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).ok()
        }
        .ok_or_else(|| {
            HubError::upstream(
                &self.origin,
                format!("no JSON-RPC response in body: {}", truncate_chars(&body, MAX_ERROR_BODY_CHARS)),
            )
        })?;

        rpc.into_result()
            .map_err(|e| HubError::upstream(&self.origin, format!("{} (code {})", e.message, e.code)))
    }

    async fn notify(&self, method: &str) -> HubResult<()> {
        self.post(&JsonRpcRequest::notification(method, None)).await.map(|_| ())
    }
}

/// Find the response for `id` among the `data:` frames of an SSE body.
fn response_from_event_stream(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut found = None;

    let mut flush = |data: &mut String| {
        if !data.is_empty() {
            if let Ok(rpc) = serde_json::from_str::<JsonRpcResponse>(data) {
                if rpc.id.as_u64() == Some(id) {
                    found = Some(rpc);
                }
            }
            data.clear();
        }
    };

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.trim().is_empty() {
            flush(&mut data);
        }
    }
    flush(&mut data);
    found
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstream {
    async fn list_tools(&self) -> HubResult<Vec<ToolSchema>> {
        list_all_pages(&self.origin, move |params| self.request("tools/list", params)).await
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
        self.request(
            "tools/call",
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    // Each request stands alone; failures surface per call.
    fn exit_reason(&self) -> Option<String> {
        None
    }

    async fn shutdown(&self) {
        let Some(sid) = self.session_id.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        let mut req = self.client.delete(&self.url).header(SESSION_HEADER, sid);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        if let Err(e) = req.send().await {
            tracing::debug!(upstream = %self.origin, error = %e, "session close request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(
        result: serde_json::Value,
    ) -> impl Fn(&wiremock::Request) -> ResponseTemplate + Send + Sync + 'static {
        move |req: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "sess-42")
                .set_body_json(json!({"jsonrpc": "2.0", "id": body["id"], "result": result}))
        }
    }

    async fn mount_handshake(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(rpc_result(json!({"protocolVersion": "2024-11-05", "capabilities": {}})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
    }

    fn config(server: &MockServer) -> UpstreamConfig {
        let mut config = UpstreamConfig::remote("docker", format!("{}/mcp", server.uri()));
        config.auth_token = Some("secret".to_string());
        config
    }

    #[tokio::test]
    async fn test_list_and_call_over_http() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer secret"))
            .and(header("mcp-session-id", "sess-42"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(rpc_result(json!({"tools": [{"name": "create_issue", "description": "Open an issue"}]})))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "create_issue"}})))
            .respond_with(rpc_result(json!({"content": [{"type": "text", "text": "#12"}]})))
            .mount(&server)
            .await;

        let upstream = HttpUpstream::connect(reqwest::Client::new(), &config(&server), Duration::from_secs(5))
            .await
            .unwrap();

        let tools = upstream.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "create_issue");

        let result = upstream.call_tool("create_issue", json!({"title": "bug"})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "#12");
    }

    #[tokio::test]
    async fn test_event_stream_response_is_parsed() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(|req: &wiremock::Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let frame = json!({"jsonrpc": "2.0", "id": body["id"], "result": {"tools": [{"name": "search"}]}});
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(format!("event: message\ndata: {}\n\n", frame))
            })
            .mount(&server)
            .await;

        let upstream = HttpUpstream::connect(reqwest::Client::new(), &config(&server), Duration::from_secs(5))
            .await
            .unwrap();
        let tools = upstream.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }

    #[tokio::test]
    async fn test_http_error_status_is_upstream_error() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let upstream = HttpUpstream::connect(reqwest::Client::new(), &config(&server), Duration::from_secs(5))
            .await
            .unwrap();
        let err = upstream.call_tool("anything", json!({})).await.unwrap_err();
        assert_eq!(err.origin(), Some("docker"));
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_spawn_error() {
        let config = UpstreamConfig::remote("docker", "http://127.0.0.1:9/mcp");
        let err = HttpUpstream::connect(reqwest::Client::new(), &config, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Spawn { .. }));
    }

    #[test]
    fn test_event_stream_picks_matching_id() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n";
        let rpc = response_from_event_stream(body, 7).unwrap();
        assert_eq!(rpc.result.unwrap()["ok"], true);
        assert!(response_from_event_stream(body, 8).is_none());
    }
}
