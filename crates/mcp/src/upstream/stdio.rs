// Local-process upstreams: newline-delimited JSON-RPC over a child's stdio

use super::client::{initialize_params, list_all_pages, UpstreamClient};
use super::config::UpstreamConfig;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolSchema};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use switchboard_core::{HubError, HubResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
const STDERR_TAIL_LINES: usize = 20;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

struct PendingState {
    waiting: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: Option<String>,
}

struct Shared {
    origin: String,
    pending: Mutex<PendingState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mark the transport dead and fail every waiting request.
    fn close(&self, reason: String) {
        let mut state = self.lock();
        if state.closed.is_none() {
            tracing::debug!(upstream = %self.origin, reason = %reason, "stdio transport closed");
            state.closed = Some(reason);
        }
        state.waiting.clear();
    }

    fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_u64() else {
            tracing::debug!(upstream = %self.origin, id = %response.id, "response with foreign id ignored");
            return;
        };
        match self.lock().waiting.remove(&id) {
            // Receiver gone means the caller timed out
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(upstream = %self.origin, id, "late or unknown response dropped"),
        }
    }

    fn closed_error(&self) -> HubError {
        let reason = self
            .lock()
            .closed
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        HubError::upstream(&self.origin, format!("connection closed: {}", reason))
    }
}

/// Removes a request from the pending map however the caller exits.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().waiting.remove(&self.id);
    }
}

/// Bi-directional JSON-RPC over a pair of byte streams.
///
/// Requests may be in flight concurrently; responses are matched by id.
pub struct StdioTransport {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new<R, W>(origin: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            origin: origin.to_string(),
            pending: Mutex::new(PendingState {
                waiting: HashMap::new(),
                closed: None,
            }),
        });
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_loop(Arc::clone(&shared), writer, outgoing_rx));
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader, outgoing.clone()));

        Self {
            shared,
            outgoing,
            next_id: AtomicU64::new(1),
            tasks: vec![writer_task, reader_task],
        }
    }

    /// Send a request and wait for the matching response's result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> HubResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.closed.is_some() {
                drop(state);
                return Err(self.shared.closed_error());
            }
            state.waiting.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| HubError::Internal(format!("failed to encode request: {}", e)))?;
        self.outgoing
            .send(line)
            .map_err(|_| self.shared.closed_error())?;

        match rx.await {
            Ok(response) => response.into_result().map_err(|e| {
                HubError::upstream(&self.shared.origin, format!("{} (code {})", e.message, e.code))
            }),
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<serde_json::Value>) -> HubResult<()> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(|e| HubError::Internal(format!("failed to encode notification: {}", e)))?;
        self.outgoing
            .send(line)
            .map_err(|_| self.shared.closed_error())
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.shared.lock().closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().waiting.len()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop<W>(shared: Arc<Shared>, writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            shared.close(format!("write failed: {}", e));
            break;
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, outgoing: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    loop {
        match lines.next().await {
            Some(Ok(line)) => handle_line(&shared, &outgoing, &line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(upstream = %shared.origin, max = MAX_LINE_BYTES, "oversized line discarded");
            }
            Some(Err(LinesCodecError::Io(e))) => {
                shared.close(format!("read failed: {}", e));
                break;
            }
            None => {
                shared.close("stdout closed".to_string());
                break;
            }
        }
    }
}

fn handle_line(shared: &Shared, outgoing: &mpsc::UnboundedSender<String>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    // Servers often log to stdout before the handshake
    let Ok(message) = serde_json::from_str::<serde_json::Value>(line) else {
        tracing::debug!(upstream = %shared.origin, line = %line, "non-JSON stdout line skipped");
        return;
    };

    let method = message.get("method").and_then(|m| m.as_str()).map(str::to_owned);
    let id = message.get("id").cloned();
    match (method, id) {
        (Some(method), Some(id)) => {
            // Server-to-client request
            let response = if method == "ping" {
                JsonRpcResponse::success(id, serde_json::json!({}))
            } else {
                JsonRpcResponse::error(id, JsonRpcError::method_not_found())
            };
            if let Ok(encoded) = serde_json::to_string(&response) {
                let _ = outgoing.send(encoded);
            }
        }
        (Some(method), None) => {
            tracing::debug!(upstream = %shared.origin, method = %method, "upstream notification");
        }
        (None, Some(_)) => match serde_json::from_value::<JsonRpcResponse>(message) {
            Ok(response) => shared.complete(response),
            Err(e) => tracing::debug!(upstream = %shared.origin, error = %e, "malformed response skipped"),
        },
        (None, None) => {
            tracing::debug!(upstream = %shared.origin, "JSON line without id or method skipped");
        }
    }
}

/// A child process speaking MCP over stdio
pub struct StdioUpstream {
    origin: String,
    transport: StdioTransport,
    exit: Arc<Mutex<Option<String>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
}

impl StdioUpstream {
    /// Spawn the process and complete the `initialize` handshake within `init_timeout`.
    pub async fn spawn(
        config: &UpstreamConfig,
        env: HashMap<String, String>,
        init_timeout: Duration,
    ) -> HubResult<Self> {
        let origin = config.id.clone();
        let spawn_error = |reason: String| HubError::Spawn {
            origin: origin.clone(),
            reason,
        };

        let program = config
            .command
            .as_deref()
            .ok_or_else(|| spawn_error("no command configured".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&config.args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("failed to spawn '{}': {}", program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            let origin = origin.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(upstream = %origin, "stderr: {}", line);
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        tracing::info!(upstream = %origin, command = %program, pid = ?child.id(), "spawned upstream process");

        let transport = StdioTransport::new(&origin, stdout, stdin);
        let exit = Arc::new(Mutex::new(None));
        let (kill_tx, kill_rx) = oneshot::channel();
        let waiter = tokio::spawn(watch_child(
            origin.clone(),
            child,
            kill_rx,
            Arc::clone(&exit),
            stderr_tail,
            stderr_task,
        ));

        let upstream = Self {
            origin: origin.clone(),
            transport,
            exit,
            kill: Mutex::new(Some(kill_tx)),
            waiter: Mutex::new(Some(waiter)),
        };

        let outcome = tokio::time::timeout(init_timeout, upstream.handshake()).await;
        let failure = match outcome {
            Ok(Ok(())) => return Ok(upstream),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("initialize timed out after {:?}", init_timeout),
        };

        // Let the waiter record how the process ended before reporting.
        let exited = upstream.exit_reason_now();
        upstream.shutdown().await;
        let reason = match exited.or_else(|| upstream.exit_reason_now()) {
            Some(detail) if detail != "stopped" => format!("{}; {}", failure, detail),
            _ => failure,
        };
        Err(spawn_error(reason))
    }

    async fn handshake(&self) -> HubResult<()> {
        let result = self.transport.request("initialize", Some(initialize_params())).await?;
        tracing::debug!(
            upstream = %self.origin,
            server = %result.pointer("/serverInfo/name").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "initialize complete"
        );
        self.transport.notify("notifications/initialized", None)
    }

    fn exit_reason_now(&self) -> Option<String> {
        self.exit.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

async fn watch_child(
    origin: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit: Arc<Mutex<Option<String>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
) {
    // A dropped sender also means "stop": the owning upstream is gone.
    let status = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let reason = match status {
        Some(Ok(status)) => {
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
            }
            let tail: Vec<String> = stderr_tail
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .cloned()
                .collect();
            tracing::warn!(upstream = %origin, %status, "upstream process exited");
            if tail.is_empty() {
                format!("process exited with {}", status)
            } else {
                format!("process exited with {}; stderr: {}", status, tail.join("\n"))
            }
        }
        Some(Err(e)) => format!("failed to wait on process: {}", e),
        None => {
            if let Err(e) = child.kill().await {
                tracing::debug!(upstream = %origin, error = %e, "kill failed, process already gone");
            }
            tracing::info!(upstream = %origin, "upstream process stopped");
            "stopped".to_string()
        }
    };

    exit.lock().unwrap_or_else(|p| p.into_inner()).get_or_insert(reason);
}

#[async_trait::async_trait]
impl UpstreamClient for StdioUpstream {
    async fn list_tools(&self) -> HubResult<Vec<ToolSchema>> {
        let transport = &self.transport;
        list_all_pages(&self.origin, move |params| transport.request("tools/list", params)).await
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> HubResult<serde_json::Value> {
        self.transport
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": name, "arguments": arguments })),
            )
            .await
    }

    fn exit_reason(&self) -> Option<String> {
        self.exit_reason_now().or_else(|| self.transport.closed_reason())
    }

    async fn shutdown(&self) {
        let kill = self.kill.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        let waiter = self.waiter.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(waiter) = waiter {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, waiter).await.is_err() {
                tracing::warn!(upstream = %self.origin, "process did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    type ServerSide = (tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>, WriteHalf<DuplexStream>);

    fn connected() -> (StdioTransport, ServerSide) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let transport = StdioTransport::new("fake", client_read, client_write);
        (transport, (BufReader::new(server_read).lines(), server_write))
    }

    async fn reply(writer: &mut WriteHalf<DuplexStream>, message: serde_json::Value) {
        let mut line = message.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (transport, (mut lines, mut writer)) = connected();

        let server = tokio::spawn(async move {
            let first: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let second: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            // Answer the second request first
            for req in [&second, &first] {
                reply(
                    &mut writer,
                    json!({"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}}),
                )
                .await;
            }
            (lines, writer)
        });

        let (a, b) = tokio::join!(transport.request("alpha", None), transport.request("beta", None));
        assert_eq!(a.unwrap()["echo"], "alpha");
        assert_eq!(b.unwrap()["echo"], "beta");
        assert_eq!(transport.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_becomes_upstream_error() {
        let (transport, (mut lines, mut writer)) = connected();

        let server = tokio::spawn(async move {
            let req: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            reply(
                &mut writer,
                json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32000, "message": "rate limited"}}),
            )
            .await;
            (lines, writer)
        });

        let err = transport.request("tools/call", None).await.unwrap_err();
        assert_eq!(err.origin(), Some("fake"));
        assert!(err.to_string().contains("rate limited"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_fails_pending_requests() {
        let (transport, (mut lines, writer)) = connected();

        let server = tokio::spawn(async move {
            let _ = lines.next_line().await;
            drop(writer);
            drop(lines);
        });

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));
        server.await.unwrap();

        assert!(transport.closed_reason().is_some());
        assert!(transport.request("tools/list", None).await.is_err());
    }

    #[tokio::test]
    async fn test_log_lines_and_server_ping_are_handled() {
        let (transport, (mut lines, mut writer)) = connected();

        let server = tokio::spawn(async move {
            let req: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            writer.write_all(b"starting server on stdio...\n").await.unwrap();
            reply(&mut writer, json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})).await;

            let pong: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(pong["id"], "srv-1");
            assert_eq!(pong["result"], json!({}));

            reply(&mut writer, json!({"jsonrpc": "2.0", "id": req["id"], "result": {"ok": true}})).await;
            (lines, writer)
        });

        let result = transport.request("initialize", None).await.unwrap();
        assert_eq!(result["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_is_removed_from_pending() {
        let (transport, _server) = connected();

        let attempt = tokio::time::timeout(Duration::from_secs(1), transport.request("slow", None)).await;
        assert!(attempt.is_err());
        assert_eq!(transport.pending_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_reports_spawn_error() {
        let config = UpstreamConfig::local("ghost", "definitely-not-a-real-binary-xyz", vec![]);
        let err = StdioUpstream::spawn(&config, HashMap::new(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Spawn { ref origin, .. } if origin == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_fails_handshake_with_exit_detail() {
        let config = UpstreamConfig::local(
            "crashy",
            "sh",
            vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
        );
        let err = StdioUpstream::spawn(&config, HashMap::new(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Spawn { ref origin, .. } if origin == "crashy"));
        assert_eq!(err.rpc_code(), -32004);
    }
}
