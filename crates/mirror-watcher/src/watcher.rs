//! File watcher with async event streaming.
//!
//! Bridges the synchronous `notify` watcher to the tokio runtime: a
//! blocking task owns the OS watcher and forwards raw events over an
//! mpsc channel; an async debounce stage coalesces bursts per path and
//! emits one [`FileChangeRecord`] per settled path, carrying the latest
//! change kind observed during the window.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use mirror_core::{ChangeKind, FileChangeRecord};

use crate::ignore::IgnoreSet;

/// Capacity of both the raw and the debounced event channels.
const CHANNEL_CAPACITY: usize = 256;

/// Files at or below this size get a content hash for dedup.
const HASH_SIZE_LIMIT: u64 = 256 * 1024;

/// Watch error.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("watch root does not exist: {}", .0.display())]
    RootNotFound(PathBuf),
    #[error("event channel closed unexpectedly")]
    ChannelClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the watcher stream yields.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A debounced filesystem change.
    Change(FileChangeRecord),
    /// The OS watch mechanism failed. Terminal: the stream closes after
    /// this and the watcher will not restart itself.
    Failed(String),
}

enum RawMsg {
    Event(Event),
    Error(String),
}

/// A debounced, filtered file watcher.
///
/// Infinite until shut down or failed; not restartable once stopped.
pub struct FileWatcher {
    shutdown_tx: Option<oneshot::Sender<()>>,
    watch_task: Option<JoinHandle<()>>,
    debounce_task: Option<JoinHandle<()>>,
    event_rx: mpsc::Receiver<WatchEvent>,
    root: PathBuf,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("root", &self.root)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Start watching `root` recursively.
    ///
    /// # Errors
    /// Returns [`WatchError::RootNotFound`] if the root does not exist and
    /// [`WatchError::Notify`] if the OS watcher fails to initialize.
    pub fn spawn(root: &Path, ignore: IgnoreSet, debounce: Duration) -> Result<Self, WatchError> {
        if !root.exists() {
            return Err(WatchError::RootNotFound(root.to_path_buf()));
        }
        let root = root.canonicalize()?;

        let (raw_tx, raw_rx) = mpsc::channel::<RawMsg>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // Synchronous side: the notify watcher posts raw events into the
        // channel from its own callback thread.
        let callback_tx = raw_tx.clone();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => RawMsg::Event(event),
                    Err(err) => RawMsg::Error(err.to_string()),
                };
                let _ = callback_tx.blocking_send(msg);
            })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        tracing::info!(root = %root.display(), "File watcher started");

        // The blocking task only keeps the watcher alive until shutdown;
        // dropping it unregisters the OS watches.
        let task_root = root.clone();
        let watch_task = tokio::task::spawn_blocking(move || {
            let _watcher = watcher;
            let _ = shutdown_rx.blocking_recv();
            drop(raw_tx);
            tracing::info!(root = %task_root.display(), "File watcher stopped");
        });

        let debounce_task = tokio::spawn(debounce_loop(raw_rx, event_tx, ignore, debounce));

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            watch_task: Some(watch_task),
            debounce_task: Some(debounce_task),
            event_rx,
            root,
        })
    }

    /// Receive the next event. `None` once the watcher has stopped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.event_rx.recv().await
    }

    /// Mutable access to the event receiver, for use in `tokio::select!`.
    pub fn events(&mut self) -> &mut mpsc::Receiver<WatchEvent> {
        &mut self.event_rx
    }

    /// The canonicalized root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the watcher tasks are still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
            && self.watch_task.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Gracefully stop watching. The watcher cannot be restarted.
    ///
    /// # Errors
    /// Returns [`WatchError::ChannelClosed`] if a watcher task panicked.
    pub async fn shutdown(mut self) -> Result<(), WatchError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.watch_task.take() {
            handle.await.map_err(|_| WatchError::ChannelClosed)?;
        }
        if let Some(handle) = self.debounce_task.take() {
            handle.await.map_err(|_| WatchError::ChannelClosed)?;
        }
        Ok(())
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct Pending {
    kind: ChangeKind,
    deadline: Instant,
}

/// Coalesce raw notify events per path, emitting one record per settled
/// path with the latest change kind observed during the window.
async fn debounce_loop(
    mut raw_rx: mpsc::Receiver<RawMsg>,
    event_tx: mpsc::Sender<WatchEvent>,
    ignore: IgnoreSet,
    window: Duration,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut failure: Option<String> = None;

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let sleep_until = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60));

        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(RawMsg::Event(event)) => {
                    let Some(kind) = map_kind(&event.kind) else {
                        continue;
                    };
                    let deadline = Instant::now() + window;
                    for path in event.paths {
                        if ignore.is_ignored(&path) {
                            tracing::trace!(path = %path.display(), "Ignored file event");
                            continue;
                        }
                        // Latest kind wins; each new event extends the window.
                        pending.insert(path, Pending { kind, deadline });
                    }
                }
                Some(RawMsg::Error(message)) => {
                    tracing::error!(%message, "OS watch mechanism failed");
                    failure = Some(message);
                    break;
                }
                None => break,
            },
            () = tokio::time::sleep_until(sleep_until), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    let Some(entry) = pending.remove(&path) else { continue };
                    let record = build_record(path, entry.kind).await;
                    if event_tx.send(WatchEvent::Change(record)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // Flush whatever was still pending so no change is silently lost.
    for (path, entry) in pending.drain() {
        let record = build_record(path, entry.kind).await;
        if event_tx.send(WatchEvent::Change(record)).await.is_err() {
            return;
        }
    }
    if let Some(message) = failure {
        let _ = event_tx.send(WatchEvent::Failed(message)).await;
    }
}

fn map_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Access(_) => None,
    }
}

/// Stat the settled path and attach size plus, for small files, a
/// content hash the sync manager can use for dedup.
async fn build_record(path: PathBuf, kind: ChangeKind) -> FileChangeRecord {
    let mut record = FileChangeRecord::new(path, kind);
    if !record.path_exists() {
        return record;
    }

    match tokio::fs::metadata(&record.path).await {
        Ok(meta) if meta.is_file() => {
            record.size_bytes = meta.len();
            if meta.len() <= HASH_SIZE_LIMIT {
                if let Ok(contents) = tokio::fs::read(&record.path).await {
                    let digest = Sha256::digest(&contents);
                    record.content_hash = Some(format!("{digest:x}"));
                }
            }
        }
        Ok(_) => {}
        Err(err) => {
            // Path vanished between the event and the stat; keep the record.
            tracing::debug!(path = %record.path.display(), %err, "Stat failed for changed path");
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ignore() -> IgnoreSet {
        IgnoreSet::new([".git"])
    }

    #[tokio::test]
    async fn spawn_rejects_missing_root() {
        let result = FileWatcher::spawn(
            Path::new("/nonexistent/path/for/mirror/tests"),
            test_ignore(),
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(WatchError::RootNotFound(_))));
    }

    #[tokio::test]
    async fn watcher_reports_running_then_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let watcher =
            FileWatcher::spawn(dir.path(), test_ignore(), Duration::from_millis(50)).unwrap();
        assert!(watcher.is_running());
        watcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn burst_of_writes_coalesces_to_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher =
            FileWatcher::spawn(dir.path(), test_ignore(), Duration::from_millis(100)).unwrap();

        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, "one").await.unwrap();
        tokio::fs::write(&file, "two").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), watcher.recv())
            .await
            .expect("no event within timeout");

        if let Some(WatchEvent::Change(record)) = event {
            assert!(record.path.ends_with("a.txt"));
            assert!(record.path_exists());
        } else {
            panic!("expected a change record, got {event:?}");
        }

        // The second write must have been folded into the same record.
        let extra = tokio::time::timeout(Duration::from_millis(300), watcher.recv()).await;
        assert!(extra.is_err(), "burst produced more than one record");

        watcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ignored_paths_produce_no_events() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join(".git")).await.unwrap();
        let mut watcher =
            FileWatcher::spawn(dir.path(), test_ignore(), Duration::from_millis(50)).unwrap();

        tokio::fs::write(dir.path().join(".git").join("HEAD"), "ref: x")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(400), watcher.recv()).await;
        assert!(event.is_err(), "ignored path leaked an event: {event:?}");

        watcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn small_files_get_content_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hashed.txt");
        tokio::fs::write(&file, "stable contents").await.unwrap();

        let record = build_record(file, ChangeKind::Modified).await;
        assert_eq!(record.size_bytes, 15);
        assert!(record.content_hash.is_some());
    }
}
