// MCP hub served over stdio: one session for the lifetime of the stream

use crate::hub::HubHandler;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub struct McpServer {
    hub: Arc<HubHandler>,
}

impl McpServer {
    pub fn new(hub: Arc<HubHandler>) -> Self {
        Self { hub }
    }

    /// Serve on the process's stdin/stdout until stdin closes.
    pub async fn start(&self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve newline-delimited JSON-RPC on any stream pair.
    ///
    /// Requests are handled concurrently; responses and server
    /// notifications share one ordered writer.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let guard = self.hub.open_session(Some(out_tx.clone()));
        let session = guard.id();
        tracing::info!(session = %session, "stdio session started");

        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LinesCodec::new());
            while let Some(message) = out_rx.recv().await {
                let line = serde_json::to_string(&message).context("failed to encode message")?;
                sink.send(line).await.context("failed to write to stdout")?;
            }
            Ok::<(), anyhow::Error>(())
        });

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut in_flight = JoinSet::new();

        while let Some(next) = lines.next().await {
            let line = match next {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(session = %session, "oversized request line discarded");
                    continue;
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::error!(session = %session, error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let hub = Arc::clone(&self.hub);
            let out = out_tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = hub.handle_str(&session, &line).await {
                    match serde_json::to_value(&response) {
                        Ok(value) => {
                            let _ = out.send(value);
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode response"),
                    }
                }
            });

            // Reap finished handlers so the set stays small
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!(session = %session, "stdio session ended");

        // Closing the session drops its notifier; the writer drains and exits
        drop(guard);
        drop(out_tx);
        writer_task.await.context("stdout writer task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::router::AggregationRouter;
    use crate::tools::{register_memory_tools, InternalToolRegistry, MemoryStore};
    use crate::upstream::{DefaultConnector, UpstreamManager, UpstreamTimeouts};
    use serde_json::json;
    use switchboard_core::events::EventBus;
    use switchboard_core::library::Library;
    use switchboard_core::secrets::StaticSecrets;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn hub() -> Arc<HubHandler> {
        let manager = Arc::new(UpstreamManager::new(
            Arc::new(DefaultConnector::new()),
            Arc::new(StaticSecrets::new()),
            UpstreamTimeouts::default(),
            EventBus::default(),
        ));
        let mut internal = InternalToolRegistry::new();
        register_memory_tools(&mut internal, Arc::new(MemoryStore::default()));
        let router = Arc::new(AggregationRouter::new(Arc::new(internal), manager));
        Arc::new(HubHandler::new(router, Arc::new(Library::new()), HubConfig::default()))
    }

    #[tokio::test]
    async fn test_stdio_session_round_trip() {
        let hub = hub();
        let server = McpServer::new(Arc::clone(&hub));
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let serving = tokio::spawn(async move { server.serve(server_read, server_write).await });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut responses = BufReader::new(client_read).lines();

        let send = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string() + "\n";
        client_write.write_all(send.as_bytes()).await.unwrap();
        let line = responses.next_line().await.unwrap().unwrap();
        let resp: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["tools"].as_array().unwrap().len(), 4);
        assert_eq!(hub.sessions().len(), 1);

        let load = json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "load_tool", "arguments": {"name": "remember"}}
        })
        .to_string()
            + "\n";
        client_write.write_all(load.as_bytes()).await.unwrap();

        // The list_changed notification is queued before the response
        let mut seen = Vec::new();
        for _ in 0..2 {
            let line = responses.next_line().await.unwrap().unwrap();
            seen.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
        }
        assert!(seen.iter().any(|m| m["method"] == "notifications/tools/list_changed"));
        assert!(seen.iter().any(|m| m["id"] == 2 && m.get("result").is_some()));

        drop(client_write);
        serving.await.unwrap().unwrap();
        assert!(hub.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let server = McpServer::new(hub());
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":\"p\",\"method\":\"ping\"}\n",
        );
        let mut output = Vec::new();
        let (out_write, mut out_read) = tokio::io::duplex(64 * 1024);

        server.serve(input.as_bytes(), out_write).await.unwrap();
        tokio::io::AsyncReadExt::read_to_end(&mut out_read, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let resp: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(resp["id"], "p");
    }
}
