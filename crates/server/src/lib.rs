// HTTP/SSE transport, admin API and process wiring for the Switchboard hub

pub mod api;
pub mod config;
pub mod hooks;
pub mod middleware;
pub mod sse;
pub mod watchdog;

pub use api::create_router;
pub use config::{AppState, ServerConfig};

use switchboard_core::events::spawn_event_logger;
use tokio::task::JoinHandle;

/// Start configured upstreams and the background tasks every transport needs.
///
/// Upstreams that fail to start are left errored; the hub serves anyway.
pub async fn start_hub(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut tasks = vec![
        spawn_event_logger(&state.events),
        watchdog::spawn(state.upstreams.clone(), watchdog::CHECK_INTERVAL),
    ];
    if let Some(handle) = hooks::spawn(&state.events, state.hooks.clone(), state.call_timeout) {
        tasks.push(handle);
    }

    for (id, result) in state.upstreams.start_enabled().await {
        match result {
            Ok(status) => tracing::info!(upstream = %id, tools = status.tool_count, "upstream ready"),
            Err(e) => tracing::warn!(upstream = %id, error = %e, "upstream failed to start"),
        }
    }
    tasks
}
