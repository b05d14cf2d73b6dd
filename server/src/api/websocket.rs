//! WebSocket stream of change events.
//!
//! ```text
//! ws://localhost:8080/api/ws/changes?topics=lot,reservation
//! ```
//!
//! Every row change is pushed as the change event itself:
//!
//! ```json
//! { "entity": "lot", "op": "update", "row": { "id": "7b0a...", "unallocated_shares": 4, ... } }
//! ```
//!
//! Control messages carry a `type` tag instead. `resync` tells the client it
//! missed events and must reload through the REST endpoints:
//!
//! ```json
//! { "type": "resync", "skipped": 12 }
//! ```
//!
//! Clients may send `{"type":"ping"}` and receive `{"type":"pong"}`. The
//! server also pings every 30 seconds.

use super::error::AppError;
use crate::server::state::AppState;
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use hisse_core::change_feed::{FeedError, Topic};
use hisse_runtime::metrics::FeedMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Duration, interval};

/// Keep-alive ping period
const PING_INTERVAL_SECS: u64 = 30;

/// Control messages exchanged on the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Events were dropped; reload everything
    Resync {
        /// Events missed
        skipped: u64,
    },
    /// Something went wrong server-side
    Error {
        /// Description
        message: String,
    },
    /// Keep-alive request
    Ping,
    /// Keep-alive answer
    Pong,
}

/// Query string of the change stream
#[derive(Debug, Default, Deserialize)]
pub struct ChangeStreamParams {
    /// Comma-separated topics; all topics when absent
    pub topics: Option<String>,
}

/// Parse `lot,reservation` into topics. Empty or absent means all.
///
/// # Errors
///
/// 400 for unknown topic names.
pub fn parse_topics(raw: Option<&str>) -> Result<Vec<Topic>, AppError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Topic::parse(name).ok_or_else(|| AppError::bad_request(format!("Unknown topic: {name}")))
        })
        .collect()
}

/// Upgrade to a change-event stream.
///
/// Returns 400 for unknown topics and 503 when the connection limit is reached.
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn change_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ChangeStreamParams>,
) -> Response {
    let topics = match parse_topics(params.topics.as_deref()) {
        Ok(topics) => topics,
        Err(err) => return err.into_response(),
    };

    let current = state.websocket_connections.load(Ordering::Relaxed);
    if current >= state.max_websocket_connections {
        tracing::warn!(
            current_connections = current,
            "WebSocket connection limit exceeded"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many concurrent connections. Please try again later.",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_change_socket(socket, topics, state))
}

/// Counts a socket as open until dropped
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn open(counter: Arc<AtomicUsize>) -> Self {
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        FeedMetrics::record_websocket_connections(count);
        tracing::info!(total_connections = count, "Change stream connected");
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        FeedMetrics::record_websocket_connections(count);
        tracing::info!(total_connections = count, "Change stream disconnected");
    }
}

fn to_text<T: Serialize>(message: &T) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json)),
        Err(error) => {
            tracing::error!(%error, "Could not encode WebSocket message");
            None
        },
    }
}

async fn handle_change_socket(socket: WebSocket, topics: Vec<Topic>, state: AppState) {
    let _guard = ConnectionGuard::open(state.websocket_connections.clone());
    let (mut sender, mut receiver) = socket.split();

    let mut events = match state.feed.subscribe(&topics).await {
        Ok(events) => events,
        Err(error) => {
            tracing::error!(%error, "Change stream subscription failed");
            if let Some(message) = to_text(&ControlMessage::Error {
                message: "Change feed unavailable".to_string(),
            }) {
                let _ = sender.send(message).await;
            }
            return;
        },
    };

    let mut keep_alive = interval(Duration::from_secs(PING_INTERVAL_SECS));
    keep_alive.tick().await;

    loop {
        let outgoing = tokio::select! {
            item = events.next() => match item {
                Some(Ok(event)) => to_text(&event),
                Some(Err(FeedError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "Change stream client lagged");
                    to_text(&ControlMessage::Resync { skipped })
                },
                Some(Err(error)) => {
                    tracing::warn!(%error, "Change feed closed");
                    break;
                },
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlMessage>(&text) {
                        Ok(ControlMessage::Ping) => to_text(&ControlMessage::Pong),
                        _ => {
                            tracing::debug!("Ignoring client message");
                            None
                        },
                    }
                },
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => None,
            },
            _ = keep_alive.tick() => Some(Message::Ping(Vec::new())),
        };

        if let Some(message) = outgoing {
            if sender.send(message).await.is_err() {
                tracing::debug!("Client disconnected during change stream");
                break;
            }
        }
    }
}
