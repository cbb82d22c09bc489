//! Sync events broadcast to remote observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionId;

/// What a sync event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    /// A coalescing window closed and a transfer began.
    SyncStart,
    /// The transfer finished successfully.
    SyncComplete,
    /// The transfer failed after exhausting retries.
    SyncError,
    /// Session status changed (degraded, watcher failure, ...).
    StatusChange,
}

/// Outcome classification carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Error,
    Info,
}

/// The unit broadcast to observers. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Owning mirror session.
    pub session_id: SessionId,
    /// Event classification.
    pub event_type: SyncEventType,
    /// Wall-clock timestamp. Non-decreasing within a session's buffer.
    pub timestamp: DateTime<Utc>,
    /// Transfer duration in milliseconds, for terminal events.
    pub duration_ms: Option<u64>,
    /// Files aggregated over the coalescing window.
    pub files_count: u64,
    /// Bytes moved over the coalescing window.
    pub bytes_transferred: u64,
    /// Outcome classification.
    pub status: EventStatus,
    /// Human-readable detail, mostly for errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncEvent {
    /// Create an event of the given type, stamped now.
    #[must_use]
    pub fn new(session_id: SessionId, event_type: SyncEventType, status: EventStatus) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_id,
            event_type,
            timestamp: Utc::now(),
            duration_ms: None,
            files_count: 0,
            bytes_transferred: 0,
            status,
            message: None,
        }
    }

    /// A `SyncStart` event for a window covering `files_count` files.
    #[must_use]
    pub fn sync_start(session_id: SessionId, files_count: u64) -> Self {
        let mut ev = Self::new(session_id, SyncEventType::SyncStart, EventStatus::Info);
        ev.files_count = files_count;
        ev
    }

    /// A successful terminal event for a window.
    #[must_use]
    pub fn sync_complete(
        session_id: SessionId,
        files_count: u64,
        bytes_transferred: u64,
        duration_ms: u64,
    ) -> Self {
        let mut ev = Self::new(session_id, SyncEventType::SyncComplete, EventStatus::Success);
        ev.files_count = files_count;
        ev.bytes_transferred = bytes_transferred;
        ev.duration_ms = Some(duration_ms);
        ev
    }

    /// A failed terminal event for a window.
    #[must_use]
    pub fn sync_error(session_id: SessionId, files_count: u64, message: impl Into<String>) -> Self {
        let mut ev = Self::new(session_id, SyncEventType::SyncError, EventStatus::Error);
        ev.files_count = files_count;
        ev.message = Some(message.into());
        ev
    }

    /// A status-change notification.
    #[must_use]
    pub fn status_change(session_id: SessionId, message: impl Into<String>) -> Self {
        let mut ev = Self::new(session_id, SyncEventType::StatusChange, EventStatus::Info);
        ev.message = Some(message.into());
        ev
    }

    /// Whether this event closes a sync window.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            SyncEventType::SyncComplete | SyncEventType::SyncError
        )
    }

    /// Rough serialized size, used for buffer accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.message.as_ref().map_or(0, String::len)
    }
}
