//! Connection hub: the single point of truth for what observers were told.
//!
//! Owns 0..N observer connections, multiplexes outbound updates across
//! them, and forwards inbound control messages to the engine over one
//! channel. Components never call into each other directly; everything
//! crosses a channel boundary.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use mirror_core::{SessionId, SyncEventType};

use crate::protocol::{ClientMessage, ServerMessage, UpdateData};

/// Per-connection bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Unique connection identifier.
    pub connection_id: Uuid,
    /// Session this observer subscribed to.
    pub session_id: SessionId,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat reply (or any inbound traffic).
    pub last_heartbeat_at: DateTime<Utc>,
    /// Event types this observer wants; `None` means all.
    pub subscribed_event_types: Option<Vec<SyncEventType>>,
}

struct ConnEntry {
    state: ConnectionState,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Inbound notifications delivered to the engine.
#[derive(Debug)]
pub enum InboundEvent {
    /// A new observer connected and should receive a history replay.
    Connected {
        connection_id: Uuid,
        session_id: SessionId,
    },
    /// An observer went away.
    Disconnected { connection_id: Uuid },
    /// A parsed message from an observer.
    Message {
        connection_id: Uuid,
        message: ClientMessage,
    },
}

/// Owns observer connections and fans out server messages.
pub struct ConnectionHub {
    connections: RwLock<HashMap<Uuid, ConnEntry>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    count_tx: watch::Sender<usize>,
}

impl ConnectionHub {
    /// Create a hub. Returns the hub, the engine's inbound event
    /// receiver, and a watch channel tracking the connection count.
    #[must_use]
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<InboundEvent>,
        watch::Receiver<usize>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0);
        (
            Self {
                connections: RwLock::new(HashMap::new()),
                inbound_tx,
                count_tx,
            },
            inbound_rx,
            count_rx,
        )
    }

    /// Register a connection and announce it to the engine.
    ///
    /// The returned receiver is the connection's outbound queue; the
    /// socket task drains it into the wire.
    pub fn register(
        &self,
        session_id: SessionId,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let state = ConnectionState {
            connection_id,
            session_id,
            connected_at: now,
            last_heartbeat_at: now,
            subscribed_event_types: None,
        };

        let count = {
            let mut connections = self.connections.write().unwrap();
            connections.insert(connection_id, ConnEntry { state, tx });
            connections.len()
        };
        let _ = self.count_tx.send(count);

        tracing::info!(%connection_id, %session_id, "Observer connected");
        let _ = self.inbound_tx.send(InboundEvent::Connected {
            connection_id,
            session_id,
        });

        (connection_id, rx)
    }

    /// Remove a connection and announce the disconnect.
    pub fn unregister(&self, connection_id: Uuid) {
        let removed = {
            let mut connections = self.connections.write().unwrap();
            let removed = connections.remove(&connection_id).is_some();
            (removed, connections.len())
        };
        if removed.0 {
            let _ = self.count_tx.send(removed.1);
            tracing::info!(%connection_id, "Observer disconnected");
            let _ = self
                .inbound_tx
                .send(InboundEvent::Disconnected { connection_id });
        }
    }

    /// Forward a parsed client message to the engine.
    pub fn forward(&self, connection_id: Uuid, message: ClientMessage) {
        self.touch(connection_id);
        if matches!(message, ClientMessage::Pong) {
            return; // heartbeat bookkeeping only
        }
        let _ = self.inbound_tx.send(InboundEvent::Message {
            connection_id,
            message,
        });
    }

    /// Restrict which sync event types a connection receives.
    ///
    /// `None` restores the default of receiving everything. Only sync
    /// events are filtered; execution output and session status always
    /// go through.
    pub fn set_subscription(&self, connection_id: Uuid, events: Option<Vec<SyncEventType>>) {
        if let Some(entry) = self.connections.write().unwrap().get_mut(&connection_id) {
            entry.state.subscribed_event_types = events;
        }
    }

    /// Send a message to every connection subscribed to `session_id`.
    pub fn broadcast(&self, session_id: SessionId, message: &ServerMessage) {
        let connections = self.connections.read().unwrap();
        for entry in connections.values() {
            if entry.state.session_id == session_id && wants(&entry.state, message) {
                let _ = entry.tx.send(message.clone());
            }
        }
    }

    /// Send a message to one connection.
    ///
    /// Returns `false` if the connection is gone. A live connection that
    /// filtered the message out still counts as delivered.
    pub fn send_to(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        self.connections
            .read()
            .unwrap()
            .get(&connection_id)
            .is_some_and(|entry| {
                if !wants(&entry.state, &message) {
                    return true;
                }
                entry.tx.send(message).is_ok()
            })
    }

    /// Record heartbeat activity for a connection.
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(entry) = self.connections.write().unwrap().get_mut(&connection_id) {
            entry.state.last_heartbeat_at = Utc::now();
        }
    }

    /// Current number of connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Number of connections subscribed to one session.
    #[must_use]
    pub fn session_connection_count(&self, session_id: SessionId) -> usize {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter(|e| e.state.session_id == session_id)
            .count()
    }

    /// Close every connection belonging to a session.
    pub fn close_session(&self, session_id: SessionId) {
        let targets: Vec<Uuid> = {
            let connections = self.connections.read().unwrap();
            connections
                .values()
                .filter(|e| e.state.session_id == session_id)
                .map(|e| e.state.connection_id)
                .collect()
        };
        for connection_id in targets {
            self.unregister(connection_id);
        }
    }

    /// Snapshot of one connection's state.
    #[must_use]
    pub fn connection_state(&self, connection_id: Uuid) -> Option<ConnectionState> {
        self.connections
            .read()
            .unwrap()
            .get(&connection_id)
            .map(|e| e.state.clone())
    }

    /// Send one heartbeat probe to every connection and close the stale
    /// ones. A connection is stale after missing two probes.
    pub fn heartbeat_sweep(&self, interval: Duration) {
        let stale_after = chrono::Duration::from_std(interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();

        let stale: Vec<Uuid> = {
            let connections = self.connections.read().unwrap();
            for entry in connections.values() {
                let _ = entry.tx.send(ServerMessage::Ping);
            }
            connections
                .values()
                .filter(|e| now - e.state.last_heartbeat_at > stale_after)
                .map(|e| e.state.connection_id)
                .collect()
        };

        for connection_id in stale {
            tracing::warn!(%connection_id, "Connection missed two heartbeats, closing");
            self.unregister(connection_id);
        }
    }

    /// Run the heartbeat loop until the hub is dropped elsewhere.
    ///
    /// Intended to be spawned once per server: sends probes on the
    /// configured interval and reaps stale connections.
    pub async fn run_heartbeats(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.heartbeat_sweep(interval);
        }
    }
}

/// Whether a connection's subscription filter lets a message through.
fn wants(state: &ConnectionState, message: &ServerMessage) -> bool {
    let Some(filter) = &state.subscribed_event_types else {
        return true;
    };
    match message {
        ServerMessage::ComponentUpdate {
            data: UpdateData::SyncEvent(event),
            ..
        } => filter.contains(&event.event_type),
        _ => true,
    }
}
