//! Engine configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Configuration for one mirror session.
///
/// Durations are stored as integer milliseconds/seconds so the config can
/// round-trip through JSON unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Root of the directory tree to mirror.
    pub local_root: PathBuf,
    /// Remote observer endpoint, informational only; the server never dials out.
    pub remote_endpoint: Option<String>,
    /// Glob-lite patterns for paths the watcher must ignore.
    pub ignore_patterns: Vec<String>,
    /// Watcher debounce window.
    pub debounce_ms: u64,
    /// Sync manager coalescing window.
    pub coalesce_ms: u64,
    /// Sync event ring capacity, in events.
    pub event_buffer_capacity: usize,
    /// Per-execution output buffer cap, in bytes.
    pub output_buffer_bytes: usize,
    /// Heartbeat interval for remote connections.
    pub heartbeat_secs: u64,
    /// Grace period for draining broadcasts on stop.
    pub stop_grace_ms: u64,
    /// Default watchdog timeout for executions, if any.
    pub default_exec_timeout_secs: Option<u64>,
    /// Retry policy shared by sync and transport.
    pub retry: RetryPolicy,
    /// Auto-commit synced changes through the git collaborator.
    pub auto_commit: bool,
}

impl MirrorConfig {
    /// Config with defaults for the given root.
    #[must_use]
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_endpoint: None,
            ignore_patterns: default_ignore_patterns(),
            debounce_ms: 500,
            coalesce_ms: 300,
            event_buffer_capacity: 1024,
            output_buffer_bytes: 1024 * 1024,
            heartbeat_secs: 30,
            stop_grace_ms: 2_000,
            default_exec_timeout_secs: None,
            retry: RetryPolicy::default(),
            auto_commit: false,
        }
    }

    /// Watcher debounce window.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Sync coalescing window.
    #[must_use]
    pub const fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Stop drain grace period.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Default execution timeout, if configured.
    #[must_use]
    pub const fn default_exec_timeout(&self) -> Option<Duration> {
        match self.default_exec_timeout_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        }
    }
}

/// Version-control internals and build artifacts nobody wants mirrored.
#[must_use]
pub fn default_ignore_patterns() -> Vec<String> {
    [".git", ".hg", ".svn", "node_modules", "target", "__pycache__", "*.swp", "*.tmp"]
        .into_iter()
        .map(String::from)
        .collect()
}
