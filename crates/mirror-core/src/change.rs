//! Filesystem change records produced by the watcher.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of filesystem mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Path was created.
    Created,
    /// Path contents were modified.
    Modified,
    /// Path was removed.
    Deleted,
    /// Path was renamed.
    Renamed,
}

/// One detected filesystem mutation.
///
/// Produced by the watcher after debouncing, consumed by the sync manager
/// which folds it into a `SyncEvent` and discards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeRecord {
    /// Absolute path of the changed file.
    pub path: PathBuf,
    /// What happened to the path.
    pub change_kind: ChangeKind,
    /// When the (debounced) change was detected.
    pub detected_at: DateTime<Utc>,
    /// SHA-256 of the file contents, when cheap to compute. Used for dedup.
    pub content_hash: Option<String>,
    /// File size at detection time; zero for deletions.
    pub size_bytes: u64,
}

impl FileChangeRecord {
    /// Create a record for the given path and kind, stamped now.
    #[must_use]
    pub fn new(path: PathBuf, change_kind: ChangeKind) -> Self {
        Self {
            path,
            change_kind,
            detected_at: Utc::now(),
            content_hash: None,
            size_bytes: 0,
        }
    }

    /// Attach a content hash.
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Attach the observed file size.
    #[must_use]
    pub const fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Whether the path still exists after this change.
    #[must_use]
    pub const fn path_exists(&self) -> bool {
        !matches!(self.change_kind, ChangeKind::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_builder_sets_fields() {
        let rec = FileChangeRecord::new(PathBuf::from("/tmp/a.txt"), ChangeKind::Modified)
            .with_hash("abc123")
            .with_size(42);
        assert_eq!(rec.size_bytes, 42);
        assert_eq!(rec.content_hash.as_deref(), Some("abc123"));
        assert!(rec.path_exists());
    }

    #[test]
    fn deleted_path_does_not_exist() {
        let rec = FileChangeRecord::new(PathBuf::from("/tmp/a.txt"), ChangeKind::Deleted);
        assert!(!rec.path_exists());
    }

    #[test]
    fn change_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ChangeKind::Created).unwrap();
        assert_eq!(json, "\"created\"");
    }
}
