//! Session and execution lifecycle state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mirror session identifier.
pub type SessionId = Uuid;

/// Lifecycle status of a mirror session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet started.
    Idle,
    /// Components are being wired up.
    Starting,
    /// Watching, syncing, and accepting connections.
    Running,
    /// No remote observers; sync and exec continue locally, events buffer.
    Degraded,
    /// Stopped cleanly.
    Stopped,
    /// Stopped due to an unrecoverable error.
    Failed,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// One mirroring lifetime, owned exclusively by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: SessionId,
    /// Root of the mirrored directory tree.
    pub local_root_path: PathBuf,
    /// Remote observer endpoint, if one was configured.
    pub remote_endpoint: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last sync/exec/connection activity.
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a new idle session for the given root.
    #[must_use]
    pub fn new(local_root_path: PathBuf, remote_endpoint: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            local_root_path,
            remote_endpoint,
            status: SessionStatus::Idle,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Record activity on this session.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Transition to a new status, updating the activity timestamp.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.touch();
    }
}

/// Status of a proxied command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// Accepted, process not yet spawned.
    Pending,
    /// Process is running.
    Running,
    /// Process exited with status zero.
    Succeeded,
    /// Process exited non-zero or failed to spawn.
    Failed,
    /// Watchdog expired and the process was terminated.
    Timeout,
    /// Cancelled by request.
    Cancelled,
}

impl ExecStatus {
    /// Whether the execution has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Degraded.is_terminal());

        assert!(ExecStatus::Timeout.is_terminal());
        assert!(ExecStatus::Cancelled.is_terminal());
        assert!(!ExecStatus::Pending.is_terminal());
        assert!(!ExecStatus::Running.is_terminal());
    }

    #[test]
    fn set_status_touches_activity() {
        let mut session = Session::new(PathBuf::from("/tmp"), None);
        let before = session.last_activity_at;
        session.set_status(SessionStatus::Running);
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.last_activity_at >= before);
    }
}
