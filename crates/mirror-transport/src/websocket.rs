//! Axum WebSocket endpoint for observer connections.
//!
//! Each accepted socket gets two tasks: one drains the connection's
//! outbound queue into the sink, one parses inbound frames and hands
//! them to the hub. Either task ending tears the connection down.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use mirror_core::{RetryPolicy, SessionId, SyncEventType};

use crate::{
    hub::ConnectionHub,
    protocol::{ClientMessage, ServerMessage},
};

/// Shared state for the websocket routes.
#[derive(Clone)]
pub struct WsState {
    hub: Arc<ConnectionHub>,
    write_retry: RetryPolicy,
}

impl WsState {
    #[must_use]
    pub fn new(hub: Arc<ConnectionHub>, write_retry: RetryPolicy) -> Self {
        Self { hub, write_retry }
    }
}

/// Router exposing `GET /ws/{session_id}`.
pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws_handler))
        .with_state(state)
}

/// Optional connection parameters.
#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    /// Comma-separated sync event types this observer wants.
    events: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, query, state))
}

async fn handle_socket(socket: WebSocket, session_id: SessionId, query: WsQuery, state: WsState) {
    let (connection_id, outbound_rx) = state.hub.register(session_id);
    if let Some(raw) = query.events {
        state
            .hub
            .set_subscription(connection_id, parse_event_filter(&raw));
    }
    let (sink, stream) = socket.split();

    let send_hub = Arc::clone(&state.hub);
    let mut send_task = tokio::spawn(send_loop(sink, outbound_rx, state.write_retry));
    let mut recv_task = tokio::spawn(recv_loop(stream, connection_id, send_hub));

    // Whichever side finishes first ends the connection.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(connection_id);
}

/// Drain the outbound queue into the socket, retrying transient write
/// failures before giving up on the connection.
async fn send_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    retry: RetryPolicy,
) {
    while let Some(message) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(?err, "Failed to serialize outbound message");
                continue;
            }
        };

        if !send_with_retry(&mut sink, &text, retry).await {
            break;
        }
    }
}

/// Returns `false` when every attempt failed and the connection should
/// be dropped.
async fn send_with_retry(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    text: &str,
    retry: RetryPolicy,
) -> bool {
    let mut delays = retry.delays();
    loop {
        match sink.send(Message::Text(text.to_string().into())).await {
            Ok(()) => return true,
            Err(err) => {
                let Some(delay) = delays.next() else {
                    tracing::warn!(?err, "Socket write failed after retries, closing");
                    return false;
                };
                tracing::debug!(?err, ?delay, "Socket write failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Parse a comma-separated `?events=` filter into event types.
///
/// Unknown names are dropped with a warning; an all-unknown (or empty)
/// filter leaves the connection unfiltered.
fn parse_event_filter(raw: &str) -> Option<Vec<SyncEventType>> {
    let types: Vec<SyncEventType> = raw
        .split(',')
        .filter_map(|token| {
            let token = token.trim();
            match serde_json::from_value(serde_json::Value::String(token.to_string())) {
                Ok(event_type) => Some(event_type),
                Err(_) => {
                    tracing::warn!(token, "Ignoring unknown event type in subscription filter");
                    None
                }
            }
        })
        .collect();
    (!types.is_empty()).then_some(types)
}

/// Parse inbound frames and forward them to the hub.
async fn recv_loop(
    mut stream: futures::stream::SplitStream<WebSocket>,
    connection_id: Uuid,
    hub: Arc<ConnectionHub>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%connection_id, ?err, "Socket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => hub.forward(connection_id, message),
                Err(err) => {
                    tracing::warn!(%connection_id, ?err, "Unparseable client message");
                    hub.send_to(
                        connection_id,
                        ServerMessage::Error {
                            message: format!("invalid message: {err}"),
                        },
                    );
                }
            },
            // Transport-level pongs also count as liveness.
            Message::Pong(_) => hub.touch(connection_id),
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_filter_parses_known_names_and_drops_the_rest() {
        assert_eq!(
            parse_event_filter("sync_error, status_change"),
            Some(vec![SyncEventType::SyncError, SyncEventType::StatusChange])
        );
        assert_eq!(
            parse_event_filter("sync_complete,bogus"),
            Some(vec![SyncEventType::SyncComplete])
        );
        assert_eq!(parse_event_filter("bogus"), None);
        assert_eq!(parse_event_filter(""), None);
    }
}
