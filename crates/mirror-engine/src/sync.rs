//! Sync manager: coalesces file changes into transfer windows.
//!
//! Changes arrive from the watcher one path at a time; the manager holds
//! them in a window, deduplicates by content hash, and hands the settled
//! batch to the [`Transfer`] collaborator. Every window produces exactly
//! one `SyncStart` and one terminal `SyncComplete`/`SyncError` in the
//! session's event store.
//!
//! Conflict policy is latest-write-wins per path: whichever change was
//! observed last inside the window is the one transferred. There is no
//! merge step.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use mirror_core::{
    ChangeKind, EventStore, FileChangeRecord, RetryPolicy, SessionId, SyncEvent, SyncEventType,
};

/// Sync manager error.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync manager has stopped")]
    Stopped,
    #[error("history export failed: {0}")]
    Export(#[from] std::io::Error),
    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A transfer attempt failure. Treated as transient and retried.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransferError(pub String);

/// Moves a settled batch of changes to the remote side.
///
/// Returns the number of bytes moved. The engine does not care how:
/// rsync, HTTP, a local copy for tests.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(&self, batch: &[FileChangeRecord]) -> Result<u64, TransferError>;
}

/// Optional version-control collaborator for auto-commit.
///
/// Failures are logged and swallowed; version control never blocks sync.
#[async_trait]
pub trait Versioner: Send + Sync {
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<(), TransferError>;
    async fn diff(&self) -> Result<String, TransferError>;
}

enum SyncCommand {
    Change(FileChangeRecord),
    ForceSync(oneshot::Sender<SyncEvent>),
    Shutdown(oneshot::Sender<()>),
}

/// Owns the coalescing loop for one session.
pub struct SyncManager {
    cmd_tx: mpsc::Sender<SyncCommand>,
    store: Arc<EventStore>,
    task: Option<JoinHandle<()>>,
}

/// Cheap submit-only handle, for the task draining the watcher.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Submit one file change for the current window.
    ///
    /// # Errors
    /// Returns [`SyncError::Stopped`] once the loop has shut down.
    pub async fn submit(&self, record: FileChangeRecord) -> Result<(), SyncError> {
        self.cmd_tx
            .send(SyncCommand::Change(record))
            .await
            .map_err(|_| SyncError::Stopped)
    }
}

impl SyncManager {
    /// Spawn the sync loop.
    ///
    /// `window` is the coalescing window: it opens on the first change
    /// after an idle period and closes after the fixed duration.
    #[must_use]
    pub fn spawn(
        session_id: SessionId,
        store: Arc<EventStore>,
        transfer: Arc<dyn Transfer>,
        versioner: Option<Arc<dyn Versioner>>,
        retry: RetryPolicy,
        window: Duration,
        auto_commit: bool,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let task = tokio::spawn(sync_loop(
            session_id,
            Arc::clone(&store),
            transfer,
            versioner,
            retry,
            window,
            auto_commit,
            cmd_rx,
        ));
        Self {
            cmd_tx,
            store,
            task: Some(task),
        }
    }

    /// Submit one file change for the current window.
    ///
    /// # Errors
    /// Returns [`SyncError::Stopped`] once the loop has shut down.
    pub async fn submit(&self, record: FileChangeRecord) -> Result<(), SyncError> {
        self.cmd_tx
            .send(SyncCommand::Change(record))
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Close the current window immediately and transfer it.
    ///
    /// With nothing pending this is a no-op: the returned event reports
    /// `files_count == 0` and the event ring is left untouched.
    ///
    /// # Errors
    /// Returns [`SyncError::Stopped`] once the loop has shut down.
    pub async fn force_sync(&self) -> Result<SyncEvent, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncCommand::ForceSync(reply_tx))
            .await
            .map_err(|_| SyncError::Stopped)?;
        reply_rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Buffered events, optionally filtered by type and limited to the
    /// newest `limit` entries (oldest first either way).
    #[must_use]
    pub fn history(
        &self,
        event_type: Option<SyncEventType>,
        limit: Option<usize>,
    ) -> Vec<SyncEvent> {
        let mut events: Vec<SyncEvent> = self
            .store
            .history()
            .into_iter()
            .filter(|ev| event_type.is_none_or(|t| ev.event_type == t))
            .collect();
        if let Some(limit) = limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
        events
    }

    /// Write the buffered history to `path` as pretty-printed JSON.
    ///
    /// # Errors
    /// Fails on serialization or file I/O errors.
    pub async fn export_history(&self, path: &Path) -> Result<(), SyncError> {
        let json = serde_json::to_vec_pretty(&self.store.history())?;
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), "Sync history exported");
        Ok(())
    }

    /// The event store backing this manager.
    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// A submit-only handle for producer tasks.
    #[must_use]
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Flush whatever is pending and stop the loop. Idempotent.
    pub async fn shutdown(&mut self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(SyncCommand::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct WindowState {
    /// Latest change per path inside the open window.
    pending: HashMap<PathBuf, FileChangeRecord>,
    /// When the open window closes; `None` while idle.
    deadline: Option<Instant>,
    /// Content hash of the last successful transfer per path.
    synced_hashes: HashMap<PathBuf, String>,
}

#[allow(clippy::too_many_arguments)]
async fn sync_loop(
    session_id: SessionId,
    store: Arc<EventStore>,
    transfer: Arc<dyn Transfer>,
    versioner: Option<Arc<dyn Versioner>>,
    retry: RetryPolicy,
    window: Duration,
    auto_commit: bool,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut state = WindowState {
        pending: HashMap::new(),
        deadline: None,
        synced_hashes: HashMap::new(),
    };

    loop {
        let deadline = state.deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SyncCommand::Change(record)) => {
                    accept_change(&mut state, record, window);
                }
                Some(SyncCommand::ForceSync(reply)) => {
                    let event = if state.pending.is_empty() {
                        // Nothing to do; report without touching the ring.
                        SyncEvent::sync_complete(session_id, 0, 0, 0)
                    } else {
                        flush_window(
                            session_id, &store, &transfer, versioner.as_deref(),
                            retry, window, auto_commit, &mut state,
                        )
                        .await
                    };
                    let _ = reply.send(event);
                }
                Some(SyncCommand::Shutdown(reply)) => {
                    if !state.pending.is_empty() {
                        flush_window(
                            session_id, &store, &transfer, versioner.as_deref(),
                            retry, window, auto_commit, &mut state,
                        )
                        .await;
                    }
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
            () = tokio::time::sleep_until(deadline), if state.deadline.is_some() => {
                flush_window(
                    session_id, &store, &transfer, versioner.as_deref(),
                    retry, window, auto_commit, &mut state,
                )
                .await;
            }
        }
    }
    tracing::debug!(%session_id, "Sync loop stopped");
}

/// Fold a change into the window, opening it if idle.
fn accept_change(state: &mut WindowState, record: FileChangeRecord, window: Duration) {
    // Unchanged content since the last successful transfer is noise.
    if let Some(hash) = &record.content_hash {
        if state.synced_hashes.get(&record.path) == Some(hash) {
            tracing::trace!(path = %record.path.display(), "Duplicate content, suppressed");
            return;
        }
    }
    if state.deadline.is_none() {
        state.deadline = Some(Instant::now() + window);
    }
    // Latest write wins within the window.
    state.pending.insert(record.path.clone(), record);
}

/// Transfer the settled window. Pushes one `SyncStart` and one terminal
/// event; on exhausted retries the batch goes back into a fresh window.
#[allow(clippy::too_many_arguments)]
async fn flush_window(
    session_id: SessionId,
    store: &EventStore,
    transfer: &Arc<dyn Transfer>,
    versioner: Option<&dyn Versioner>,
    retry: RetryPolicy,
    window: Duration,
    auto_commit: bool,
    state: &mut WindowState,
) -> SyncEvent {
    let batch: Vec<FileChangeRecord> = state.pending.drain().map(|(_, r)| r).collect();
    state.deadline = None;
    let files_count = batch.len() as u64;

    store.push(SyncEvent::sync_start(session_id, files_count));
    let started = Instant::now();

    let result = retry
        .run("sync transfer", || transfer.transfer(&batch))
        .await;

    match result {
        Ok(bytes_transferred) => {
            for record in &batch {
                match record.change_kind {
                    ChangeKind::Deleted => {
                        state.synced_hashes.remove(&record.path);
                    }
                    _ => {
                        if let Some(hash) = &record.content_hash {
                            state.synced_hashes.insert(record.path.clone(), hash.clone());
                        }
                    }
                }
            }
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let event =
                SyncEvent::sync_complete(session_id, files_count, bytes_transferred, duration_ms);
            store.push(event.clone());
            tracing::info!(%session_id, files_count, bytes_transferred, "Sync window complete");

            if auto_commit {
                if let Some(versioner) = versioner {
                    auto_commit_batch(versioner, &batch).await;
                }
            }
            event
        }
        Err(err) => {
            // The batch stays dirty; a fresh window picks it up.
            for record in batch {
                state.pending.insert(record.path.clone(), record);
            }
            state.deadline = Some(Instant::now() + window);

            let event = SyncEvent::sync_error(session_id, files_count, err.to_string());
            store.push(event.clone());
            tracing::warn!(%session_id, files_count, %err, "Sync window failed, files stay dirty");
            event
        }
    }
}

async fn auto_commit_batch(versioner: &dyn Versioner, batch: &[FileChangeRecord]) {
    let paths: Vec<PathBuf> = batch.iter().map(|r| r.path.clone()).collect();
    let message = format!("mirror sync: {} file(s)", paths.len());
    if let Err(err) = versioner.commit(&paths, &message).await {
        // Version control never blocks sync.
        tracing::warn!(%err, "Auto-commit failed");
    }
}
