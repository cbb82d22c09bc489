//! Broadcast + bounded history store for sync events.
//!
//! Essential for reconnection: a new observer receives the buffered
//! history first, then seamlessly switches to live updates.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::SyncEvent;

/// Default ring capacity in events.
const DEFAULT_CAPACITY: usize = 1024;

struct Inner {
    history: VecDeque<SyncEvent>,
    capacity: usize,
    /// High-water mark used to keep buffer timestamps non-decreasing.
    last_timestamp: Option<DateTime<Utc>>,
}

/// Bounded ring buffer of [`SyncEvent`]s with live broadcast.
///
/// The writer is the owning sync manager; readers are the communication
/// hub's broadcast path and late-subscribing replay streams.
pub struct EventStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventStore {
    /// Create a store retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                last_timestamp: None,
            }),
            sender,
        }
    }

    /// Append an event to history and fan it out to live listeners.
    ///
    /// Timestamps are clamped so the buffer stays monotonically
    /// non-decreasing even if the wall clock steps backwards.
    pub fn push(&self, mut event: SyncEvent) {
        let mut inner = self.inner.write().unwrap();
        if let Some(last) = inner.last_timestamp {
            if event.timestamp < last {
                event.timestamp = last;
            }
        }
        inner.last_timestamp = Some(event.timestamp);

        while inner.history.len() >= inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        // Sent under the lock so a concurrent subscriber sees each event
        // in exactly one of history or the live feed, never both.
        let _ = self.sender.send(event); // no listeners is fine
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the buffered history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SyncEvent> {
        self.inner.read().unwrap().history.iter().cloned().collect()
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().history.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream that yields buffered history first, then live updates.
    ///
    /// Lagged live listeners silently skip dropped events; consumers
    /// needing strict ordering should use `event_id`/`timestamp`.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SyncEvent> {
        // Snapshot and subscribe under one read lock; see `push`.
        let (history, rx) = {
            let inner = self.inner.read().unwrap();
            let history: Vec<SyncEvent> = inner.history.iter().cloned().collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
