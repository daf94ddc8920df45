// Command hooks run on tool-call events

use crate::config::HookConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::events::{EventBus, HubEvent};
use switchboard_mcp::tools::run_command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Subscribe `hooks` to the bus. Returns `None` when there are no hooks.
///
/// Each matching event runs in its own task, so a slow hook never holds up
/// a tool call or the other hooks.
pub fn spawn(bus: &EventBus, hooks: Vec<HookConfig>, timeout: Duration) -> Option<JoinHandle<()>> {
    if hooks.is_empty() {
        return None;
    }
    tracing::info!(count = hooks.len(), "command hooks registered");

    let hooks = Arc::new(hooks);
    let mut rx = bus.subscribe();
    Some(tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => dispatch(&hooks, event, timeout),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "hooks lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }))
}

fn dispatch(hooks: &Arc<Vec<HookConfig>>, event: HubEvent, timeout: Duration) {
    let name = event.event_type.name();
    if !hooks.iter().any(|h| h.event.name() == name) {
        return;
    }

    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(event = name, error = %e, "failed to encode event for hooks");
            return;
        }
    };

    for hook in hooks.iter().filter(|h| h.event.name() == name) {
        let hook = hook.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            run_hook(&hook, payload, timeout).await;
        });
    }
}

async fn run_hook(hook: &HookConfig, payload: Vec<u8>, timeout: Duration) {
    let result = run_command(&hook.command, &hook.args, &HashMap::new(), None, Some(payload), timeout).await;
    match result {
        Ok(output) if output.success() => {
            tracing::debug!(hook = %hook.command, event = hook.event.name(), "hook finished");
        }
        Ok(output) => {
            tracing::warn!(
                hook = %hook.command,
                exit_code = ?output.exit_code,
                "hook exited unsuccessfully: {}",
                output.stderr.trim()
            );
        }
        Err(e) => {
            tracing::warn!(hook = %hook.command, error = %e, "hook failed to run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HookEvent;
    use switchboard_core::events::{CallOutcome, EventType};

    #[tokio::test]
    async fn test_no_hooks_no_task() {
        let bus = EventBus::new(8);
        assert!(spawn(&bus, Vec::new(), Duration::from_secs(1)).is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_post_call_hook_receives_event_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event.json");

        let bus = EventBus::new(8);
        let hooks = vec![
            HookConfig {
                event: HookEvent::PostToolCall,
                command: "sh".to_string(),
                args: vec!["-c".to_string(), format!("cat > {0}.tmp && mv {0}.tmp {0}", out.display())],
            },
            HookConfig {
                event: HookEvent::PreToolCall,
                command: "sh".to_string(),
                args: vec!["-c".to_string(), format!("echo pre > {}.pre", out.display())],
            },
        ];
        let handle = spawn(&bus, hooks, Duration::from_secs(5)).unwrap();

        bus.publish(EventType::PostToolCall {
            tool_name: "remember".to_string(),
            arguments: serde_json::json!({"content": "x"}),
            outcome: CallOutcome::Success {
                result: serde_json::json!({}),
            },
            duration_ms: 3,
        });

        let mut written = None;
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(&out) {
                if !content.is_empty() {
                    written = Some(content);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let event: serde_json::Value = serde_json::from_str(&written.unwrap()).unwrap();
        assert_eq!(event["type"], "post_tool_call");
        assert_eq!(event["tool_name"], "remember");
        assert!(!dir.path().join("event.json.pre").exists());

        handle.abort();
    }
}
