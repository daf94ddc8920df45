// Hub events: tool-call observation and upstream state changes

use crate::types::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event published on the hub's event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
}

impl HubEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur in the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    PreToolCall {
        tool_name: String,
        arguments: serde_json::Value,
    },
    PostToolCall {
        tool_name: String,
        arguments: serde_json::Value,
        outcome: CallOutcome,
        duration_ms: u64,
    },
    UpstreamStateChanged {
        upstream_id: String,
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
}

impl EventType {
    /// Stable event name, used for hook matching and SSE event names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreToolCall { .. } => "pre_tool_call",
            Self::PostToolCall { .. } => "post_tool_call",
            Self::UpstreamStateChanged { .. } => "upstream_state_changed",
        }
    }
}

/// Result of a tool call as seen by observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { result: serde_json::Value },
    Failure { kind: String, error: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Broadcast bus the router publishes to.
///
/// Publishers never wait on subscribers; a slow subscriber lags and loses
/// the oldest events instead of back-pressuring tool calls.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event_type: EventType) {
        // No subscribers is fine
        let _ = self.sender.send(HubEvent::new(event_type));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Spawn a subscriber that writes every event to the tracing log.
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &HubEvent) {
    match &event.event_type {
        EventType::PreToolCall { tool_name, .. } => {
            tracing::debug!(tool = %tool_name, "pre_tool_call");
        }
        EventType::PostToolCall {
            tool_name,
            outcome,
            duration_ms,
            ..
        } => match outcome {
            CallOutcome::Success { .. } => {
                tracing::info!(tool = %tool_name, duration_ms, "post_tool_call ok");
            }
            CallOutcome::Failure { kind, error } => {
                tracing::warn!(tool = %tool_name, duration_ms, kind = %kind, "post_tool_call failed: {}", error);
            }
        },
        EventType::UpstreamStateChanged {
            upstream_id,
            state,
            last_error,
        } => {
            tracing::info!(upstream = %upstream_id, state = ?state, last_error = ?last_error, "upstream state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EventType::PreToolCall {
            tool_name: "search".to_string(),
            arguments: serde_json::json!({}),
        });

        assert_eq!(a.recv().await.unwrap().event_type.name(), "pre_tool_call");
        assert_eq!(b.recv().await.unwrap().event_type.name(), "pre_tool_call");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(EventType::UpstreamStateChanged {
            upstream_id: "github".to_string(),
            state: ConnectionState::Ready,
            last_error: None,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = HubEvent::new(EventType::PostToolCall {
            tool_name: "github__create_issue".to_string(),
            arguments: serde_json::json!({"title": "bug"}),
            outcome: CallOutcome::Failure {
                kind: "upstream_timeout".to_string(),
                error: "timed out".to_string(),
            },
            duration_ms: 30_000,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "post_tool_call");
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["duration_ms"], 30_000);
    }
}
