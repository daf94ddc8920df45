//! Hub transport over HTTP: a Server-Sent Events stream per session plus a
//! POST endpoint for the session's JSON-RPC messages.
//!
//! The session lives exactly as long as its SSE stream. When the client
//! disconnects axum drops the stream, which drops the session guard.

use crate::api::ErrorResponse;
use crate::config::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use switchboard_core::session::SessionGuard;
use switchboard_core::SessionId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

pub const MESSAGES_PATH: &str = "/hub/messages";

type EventResult = Result<Event, Infallible>;

/// SSE stream that owns its session
struct SessionStream {
    inner: BoxStream<'static, EventResult>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = EventResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// `GET /hub/sse`: open a session and stream its notifications
pub async fn hub_stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = EventResult>> {
    let (tx, rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let guard = state.hub.open_session(Some(tx));
    let session = guard.id();

    let endpoint = Event::default()
        .event("endpoint")
        .json_data(serde_json::json!({
            "event": "endpoint",
            "data": format!("{}?sessionId={}", MESSAGES_PATH, session),
        }))
        .unwrap_or_default();

    let notifications = UnboundedReceiverStream::new(rx).map(|message| {
        Ok::<_, Infallible>(Event::default()
            .event("message")
            .json_data(message)
            .unwrap_or_default())
    });

    let stream = SessionStream {
        inner: stream::once(async move { Ok::<_, Infallible>(endpoint) })
            .chain(notifications)
            .boxed(),
        _guard: guard,
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keepalive).text("keepalive"))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `POST /hub/messages?sessionId=<id>`: one JSON-RPC message for a session.
///
/// Requests get their response in the HTTP body; notifications get 202.
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let Some(raw_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Missing sessionId query parameter")),
        )
            .into_response();
    };

    let session = match SessionId::parse(&raw_id) {
        Some(id) if state.hub.sessions().contains(&id) => id,
        _ => {
            tracing::debug!(session = %raw_id, "message for unknown session");
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(format!("Session not found: {}", raw_id))),
            )
                .into_response();
        }
    };

    match state.hub.handle_str(&session, &body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// `GET /api/events`: live hub events for dashboards
pub async fn event_stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = EventResult>> {
    let events = BroadcastStream::new(state.events.subscribe()).map(|next| {
        let event = match next {
            Ok(event) => Event::default()
                .event(event.event_type.name())
                .json_data(&event)
                .unwrap_or_default(),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                Event::default().comment(format!("lagged, {} events skipped", skipped))
            }
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.keepalive).text("keepalive"))
}
