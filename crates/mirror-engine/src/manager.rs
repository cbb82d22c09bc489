//! Engine orchestrator: session lifecycle and component wiring.
//!
//! One engine owns any number of mirror sessions. Per session it wires
//! watcher → sync manager → event store, and a command execution proxy.
//! Observer traffic flows through the shared [`ConnectionHub`]: inbound
//! actions arrive on the hub's event channel; outbound updates are
//! broadcast per session.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use futures::StreamExt;
use serde_json::Value;
use tokio::{
    sync::{RwLock, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use mirror_core::{
    EventStore, MirrorConfig, Session, SessionId, SessionStatus, SyncEvent,
};
use mirror_executor::{
    ClaudeCommand, CommandExecutionProxy, ExecError, ExecRequest, ExecutionSnapshot, OutputChunk,
};
use mirror_transport::{
    ActionKind, CancelParams, ClientMessage, ConnectionHub, DataType, ExecuteParams,
    HistoryFilter, InboundEvent, OutputStreamKind, ServerMessage, UpdateData,
};
use mirror_watcher::{FileWatcher, IgnoreSet, WatchEvent};

use crate::sync::{SyncError, SyncManager, Transfer, Versioner};

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error(transparent)]
    Watch(#[from] mirror_watcher::WatchError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

struct SessionRuntime {
    session: Session,
    config: MirrorConfig,
    store: Arc<EventStore>,
    sync: SyncManager,
    proxy: Arc<CommandExecutionProxy>,
    watcher_stop: Option<oneshot::Sender<()>>,
    watcher_task: Option<JoinHandle<()>>,
}

struct Inner {
    hub: Arc<ConnectionHub>,
    sessions: RwLock<HashMap<SessionId, SessionRuntime>>,
    transfer: Arc<dyn Transfer>,
    versioner: Option<Arc<dyn Versioner>>,
}

/// The engine facade. Cheap to clone.
#[derive(Clone)]
pub struct MirrorEngine {
    inner: Arc<Inner>,
}

impl MirrorEngine {
    /// Create the engine and spawn its control loops.
    ///
    /// `inbound_rx` and `count_rx` come from [`ConnectionHub::new`].
    #[must_use]
    pub fn new(
        hub: Arc<ConnectionHub>,
        inbound_rx: tokio::sync::mpsc::UnboundedReceiver<InboundEvent>,
        count_rx: watch::Receiver<usize>,
        transfer: Arc<dyn Transfer>,
        versioner: Option<Arc<dyn Versioner>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            hub,
            sessions: RwLock::new(HashMap::new()),
            transfer,
            versioner,
        });
        tokio::spawn(control_loop(Arc::clone(&inner), inbound_rx));
        tokio::spawn(connection_monitor(Arc::clone(&inner), count_rx));
        Self { inner }
    }

    /// Start a mirror session for the configured root.
    ///
    /// # Errors
    /// Fails fast if the root cannot be watched.
    pub async fn start(&self, config: MirrorConfig) -> Result<Session, EngineError> {
        let mut session = Session::new(config.local_root.clone(), config.remote_endpoint.clone());
        session.set_status(SessionStatus::Starting);
        let session_id = session.session_id;

        let store = Arc::new(EventStore::new(config.event_buffer_capacity));
        let sync = SyncManager::spawn(
            session_id,
            Arc::clone(&store),
            Arc::clone(&self.inner.transfer),
            self.inner.versioner.clone(),
            config.retry,
            config.coalesce_window(),
            config.auto_commit,
        );

        let ignore = IgnoreSet::new(config.ignore_patterns.iter().cloned());
        let watcher = FileWatcher::spawn(&config.local_root, ignore, config.debounce())?;

        let (watcher_stop, stop_rx) = oneshot::channel();
        let watcher_task = tokio::spawn(watch_loop(
            Arc::clone(&self.inner),
            session_id,
            watcher,
            sync.handle(),
            stop_rx,
        ));

        let proxy = Arc::new(CommandExecutionProxy::new(
            config.output_buffer_bytes,
            config.default_exec_timeout(),
        ));

        session.set_status(SessionStatus::Running);
        store.push(SyncEvent::status_change(session_id, "session started"));
        tracing::info!(%session_id, root = %config.local_root.display(), "Mirror session started");

        let runtime = SessionRuntime {
            session: session.clone(),
            config,
            store,
            sync,
            proxy,
            watcher_stop: Some(watcher_stop),
            watcher_task: Some(watcher_task),
        };
        self.inner.sessions.write().await.insert(session_id, runtime);
        Ok(session)
    }

    /// Stop a session: cancel executions with grace, stop the watcher,
    /// flush the sync window, drain broadcasts, close connections.
    ///
    /// # Errors
    /// Returns [`EngineError::SessionNotFound`] for unknown ids.
    pub async fn stop(&self, session_id: SessionId) -> Result<Session, EngineError> {
        let mut runtime = self
            .inner
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;

        let grace = runtime.config.stop_grace();
        tracing::info!(%session_id, "Stopping mirror session");

        // Executions first; the session is terminal only once they are.
        runtime.proxy.cancel_all(grace).await;

        if let Some(stop) = runtime.watcher_stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = runtime.watcher_task.take() {
            let _ = task.await;
        }
        runtime.sync.shutdown().await;

        runtime.session.set_status(SessionStatus::Stopped);
        self.inner.hub.broadcast(
            session_id,
            &ServerMessage::update(
                session_id,
                UpdateData::SessionStatus {
                    status: SessionStatus::Stopped,
                },
            ),
        );

        // Let socket tasks flush queued updates before the connections
        // go; with nobody listening there is nothing to flush.
        if self.inner.hub.session_connection_count(session_id) > 0 {
            tokio::time::sleep(grace).await;
        }
        self.inner.hub.close_session(session_id);

        Ok(runtime.session)
    }

    /// Current session record.
    ///
    /// # Errors
    /// Returns [`EngineError::SessionNotFound`] for unknown ids.
    pub async fn get_status(&self, session_id: SessionId) -> Result<Session, EngineError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|r| r.session.clone())
            .ok_or(EngineError::SessionNotFound(session_id))
    }

    /// Flush the session's coalescing window immediately.
    ///
    /// # Errors
    /// Returns [`EngineError::SessionNotFound`] for unknown ids.
    pub async fn force_sync(&self, session_id: SessionId) -> Result<SyncEvent, EngineError> {
        let sessions = self.inner.sessions.read().await;
        let runtime = sessions
            .get(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        Ok(runtime.sync.force_sync().await?)
    }

    /// Start a proxied `claude` CLI execution and stream its output to
    /// the session's observers.
    ///
    /// # Errors
    /// Fails fast if the CLI cannot be resolved or the working directory
    /// does not exist; no execution state is created in that case.
    pub async fn execute_claude_command(
        &self,
        session_id: SessionId,
        params: ExecuteParams,
    ) -> Result<Uuid, EngineError> {
        let mut command = ClaudeCommand::new();
        if let Some(model) = params.model {
            command = command.model(model);
        }
        if let Some(dir) = params.working_dir {
            command = command.working_dir(PathBuf::from(dir));
        }
        command = command.extra_args(params.extra_args);
        if let Some(secs) = params.timeout_secs {
            command = command.timeout(std::time::Duration::from_secs(secs));
        }
        self.execute_request(session_id, command.build()).await
    }

    /// Start an arbitrary execution under a session, wiring its output
    /// chunks to the hub as `component_update`s.
    ///
    /// # Errors
    /// Same failure modes as [`Self::execute_claude_command`].
    pub async fn execute_request(
        &self,
        session_id: SessionId,
        mut request: ExecRequest,
    ) -> Result<Uuid, EngineError> {
        let (proxy, default_dir) = {
            let sessions = self.inner.sessions.read().await;
            let runtime = sessions
                .get(&session_id)
                .ok_or(EngineError::SessionNotFound(session_id))?;
            (
                Arc::clone(&runtime.proxy),
                runtime.session.local_root_path.clone(),
            )
        };
        if request.working_dir.is_none() {
            request.working_dir = Some(default_dir);
        }

        let handle = proxy.execute(session_id, request).await?;
        let exec_id = handle.exec_id;

        let hub = Arc::clone(&self.inner.hub);
        let stream_proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let mut chunks = handle.output.chunk_stream();
            while let Some(chunk) = chunks.next().await {
                let message = match chunk {
                    OutputChunk::Stdout(data) => ServerMessage::exec_output(
                        session_id,
                        exec_id,
                        OutputStreamKind::Stdout,
                        &data,
                    ),
                    OutputChunk::Stderr(data) => ServerMessage::exec_output(
                        session_id,
                        exec_id,
                        OutputStreamKind::Stderr,
                        &data,
                    ),
                    OutputChunk::Truncated => {
                        ServerMessage::update(session_id, UpdateData::ExecTruncated { exec_id })
                    }
                    OutputChunk::Finished(status) => {
                        let exit_code = stream_proxy
                            .get_status(exec_id)
                            .await
                            .ok()
                            .and_then(|s| s.exit_code);
                        ServerMessage::update(
                            session_id,
                            UpdateData::ExecStatus {
                                exec_id,
                                status,
                                exit_code,
                            },
                        )
                    }
                };
                hub.broadcast(session_id, &message);
            }
        });

        Ok(exec_id)
    }

    /// Cancel an execution. Idempotent.
    ///
    /// # Errors
    /// Returns [`EngineError::SessionNotFound`] / [`ExecError::NotFound`]
    /// for unknown ids.
    pub async fn cancel_execution(
        &self,
        session_id: SessionId,
        exec_id: Uuid,
    ) -> Result<ExecutionSnapshot, EngineError> {
        let proxy = {
            let sessions = self.inner.sessions.read().await;
            let runtime = sessions
                .get(&session_id)
                .ok_or(EngineError::SessionNotFound(session_id))?;
            Arc::clone(&runtime.proxy)
        };
        Ok(proxy.cancel(exec_id).await?)
    }

    /// Export a session's buffered history to a JSON file.
    ///
    /// # Errors
    /// Returns [`EngineError::SessionNotFound`] for unknown ids and
    /// propagates export I/O failures.
    pub async fn export_history(
        &self,
        session_id: SessionId,
        path: &std::path::Path,
    ) -> Result<(), EngineError> {
        let sessions = self.inner.sessions.read().await;
        let runtime = sessions
            .get(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        Ok(runtime.sync.export_history(path).await?)
    }

    /// Ids of sessions currently running.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.read().await.keys().copied().collect()
    }
}

/// Drain the watcher into the sync manager until stopped or failed.
async fn watch_loop(
    inner: Arc<Inner>,
    session_id: SessionId,
    mut watcher: FileWatcher,
    sync: crate::sync::SyncHandle,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = watcher.recv() => match event {
                Some(WatchEvent::Change(record)) => {
                    if sync.submit(record).await.is_err() {
                        break;
                    }
                }
                Some(WatchEvent::Failed(message)) => {
                    tracing::error!(%session_id, %message, "Watcher failed, session degraded to failed");
                    mark_failed(&inner, session_id, &message).await;
                    break;
                }
                None => break,
            },
            _ = &mut stop_rx => {
                let _ = watcher.shutdown().await;
                return;
            }
        }
    }
}

/// Mark a session failed after an unrecoverable component error.
///
/// Same teardown order as [`MirrorEngine::stop`]: executions are
/// cancelled and the sync window flushed before the status turns
/// terminal.
async fn mark_failed(inner: &Inner, session_id: SessionId, message: &str) {
    let teardown = {
        let sessions = inner.sessions.read().await;
        sessions
            .get(&session_id)
            .map(|r| (Arc::clone(&r.proxy), r.config.stop_grace()))
    };
    let Some((proxy, grace)) = teardown else {
        return;
    };
    proxy.cancel_all(grace).await;

    let mut sessions = inner.sessions.write().await;
    if let Some(runtime) = sessions.get_mut(&session_id) {
        runtime.sync.shutdown().await;
        runtime.session.set_status(SessionStatus::Failed);
        runtime
            .store
            .push(SyncEvent::status_change(session_id, format!("watcher failed: {message}")));
        inner.hub.broadcast(
            session_id,
            &ServerMessage::update(
                session_id,
                UpdateData::SessionStatus {
                    status: SessionStatus::Failed,
                },
            ),
        );
    }
}

/// Dispatch inbound hub events: replay for new connections, control
/// actions and data requests for everyone else.
async fn control_loop(
    inner: Arc<Inner>,
    mut inbound_rx: tokio::sync::mpsc::UnboundedReceiver<InboundEvent>,
) {
    while let Some(event) = inbound_rx.recv().await {
        match event {
            InboundEvent::Connected {
                connection_id,
                session_id,
            } => {
                spawn_event_pump(&inner, connection_id, session_id).await;
            }
            InboundEvent::Disconnected { .. } => {
                // Event pumps notice the dead connection on their next send.
            }
            InboundEvent::Message {
                connection_id,
                message,
            } => {
                handle_message(&inner, connection_id, message).await;
            }
        }
    }
}

/// Per-connection pump: replay the session's buffered events, then
/// follow the live feed, until the connection goes away.
async fn spawn_event_pump(inner: &Arc<Inner>, connection_id: Uuid, session_id: SessionId) {
    let store = {
        let sessions = inner.sessions.read().await;
        sessions.get(&session_id).map(|r| Arc::clone(&r.store))
    };
    let Some(store) = store else {
        inner.hub.send_to(
            connection_id,
            ServerMessage::Error {
                message: format!("unknown session: {session_id}"),
            },
        );
        return;
    };

    let hub = Arc::clone(&inner.hub);
    tokio::spawn(async move {
        let mut events = store.history_plus_stream();
        while let Some(event) = events.next().await {
            let message = ServerMessage::update(session_id, UpdateData::SyncEvent(event));
            if !hub.send_to(connection_id, message) {
                break;
            }
        }
    });
}

async fn handle_message(inner: &Arc<Inner>, connection_id: Uuid, message: ClientMessage) {
    let result = match message {
        ClientMessage::ComponentAction {
            session_id,
            action,
            parameters,
        } => handle_action(inner, connection_id, session_id, action, parameters).await,
        ClientMessage::DataRequest {
            session_id,
            data_type,
            filters,
        } => handle_data_request(inner, connection_id, session_id, data_type, filters).await,
        ClientMessage::Pong => Ok(()), // filtered out by the hub
    };
    if let Err(message) = result {
        tracing::warn!(%connection_id, %message, "Rejected client message");
        inner
            .hub
            .send_to(connection_id, ServerMessage::Error { message });
    }
}

async fn handle_action(
    inner: &Arc<Inner>,
    connection_id: Uuid,
    session_id: SessionId,
    action: ActionKind,
    parameters: Value,
) -> Result<(), String> {
    let engine = MirrorEngine {
        inner: Arc::clone(inner),
    };
    match action {
        ActionKind::ForceSync => {
            let event = engine
                .force_sync(session_id)
                .await
                .map_err(|e| e.to_string())?;
            // An empty window never reaches the event ring, so the
            // requester would otherwise hear nothing back.
            if event.files_count == 0 {
                inner.hub.send_to(
                    connection_id,
                    ServerMessage::update(session_id, UpdateData::SyncEvent(event)),
                );
            }
            Ok(())
        }
        ActionKind::ExecuteCommand => {
            let params: ExecuteParams =
                serde_json::from_value(parameters).map_err(|e| format!("bad parameters: {e}"))?;
            engine
                .execute_claude_command(session_id, params)
                .await
                .map(drop)
                .map_err(|e| e.to_string())
        }
        ActionKind::CancelExecution => {
            let params: CancelParams =
                serde_json::from_value(parameters).map_err(|e| format!("bad parameters: {e}"))?;
            engine
                .cancel_execution(session_id, params.exec_id)
                .await
                .map(drop)
                .map_err(|e| e.to_string())
        }
        ActionKind::StopSession => engine
            .stop(session_id)
            .await
            .map(drop)
            .map_err(|e| e.to_string()),
    }
}

async fn handle_data_request(
    inner: &Arc<Inner>,
    connection_id: Uuid,
    session_id: SessionId,
    data_type: DataType,
    filters: Value,
) -> Result<(), String> {
    let sessions = inner.sessions.read().await;
    let runtime = sessions
        .get(&session_id)
        .ok_or_else(|| format!("unknown session: {session_id}"))?;

    let data = match data_type {
        DataType::SyncHistory => {
            let filter: HistoryFilter = serde_json::from_value(filters).unwrap_or_default();
            let events = runtime.sync.history(filter.event_type, filter.limit);
            serde_json::to_value(events).map_err(|e| e.to_string())?
        }
        DataType::Executions => {
            let snapshots = runtime.proxy.list().await;
            serde_json::to_value(snapshots).map_err(|e| e.to_string())?
        }
        DataType::Session => {
            serde_json::to_value(&runtime.session).map_err(|e| e.to_string())?
        }
    };
    drop(sessions);

    inner.hub.send_to(
        connection_id,
        ServerMessage::DataResponse {
            session_id,
            data_type,
            data,
        },
    );
    Ok(())
}

/// Flip sessions between Running and Degraded as observers come and go.
async fn connection_monitor(inner: Arc<Inner>, mut count_rx: watch::Receiver<usize>) {
    while count_rx.changed().await.is_ok() {
        let mut sessions = inner.sessions.write().await;
        for runtime in sessions.values_mut() {
            let session_id = runtime.session.session_id;
            let observers = inner.hub.session_connection_count(session_id);
            let next = match (runtime.session.status, observers) {
                (SessionStatus::Running, 0) => Some(SessionStatus::Degraded),
                (SessionStatus::Degraded, n) if n > 0 => Some(SessionStatus::Running),
                _ => None,
            };
            if let Some(status) = next {
                tracing::info!(%session_id, ?status, observers, "Session status changed");
                runtime.session.set_status(status);
                runtime.store.push(SyncEvent::status_change(
                    session_id,
                    match status {
                        SessionStatus::Degraded => "no observers connected",
                        _ => "observer reconnected",
                    },
                ));
                inner.hub.broadcast(
                    session_id,
                    &ServerMessage::update(session_id, UpdateData::SessionStatus { status }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::sync::TransferError;
    use mirror_core::{FileChangeRecord, SyncEventType};

    struct ByteCountTransfer;

    #[async_trait]
    impl Transfer for ByteCountTransfer {
        async fn transfer(&self, batch: &[FileChangeRecord]) -> Result<u64, TransferError> {
            Ok(batch.iter().map(|r| r.size_bytes).sum())
        }
    }

    fn engine() -> (MirrorEngine, Arc<ConnectionHub>) {
        let (hub, inbound_rx, count_rx) = ConnectionHub::new();
        let hub = Arc::new(hub);
        let engine = MirrorEngine::new(
            Arc::clone(&hub),
            inbound_rx,
            count_rx,
            Arc::new(ByteCountTransfer),
            None,
        );
        (engine, hub)
    }

    fn fast_config(root: &std::path::Path) -> MirrorConfig {
        let mut config = MirrorConfig::new(root);
        config.debounce_ms = 50;
        config.coalesce_ms = 50;
        config.stop_grace_ms = 100;
        config
    }

    async fn recv_update(
        rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Option<(SessionId, UpdateData)> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ServerMessage::ComponentUpdate {
                    session_id, data, ..
                })) => return Some((session_id, data)),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _hub) = engine();

        let session = engine.start(fast_config(dir.path())).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);

        let status = engine.get_status(session.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Running);

        let stopped = engine.stop(session.session_id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(matches!(
            engine.get_status(session.session_id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_rejects_missing_root() {
        let (engine, _hub) = engine();
        let config = fast_config(std::path::Path::new("/nonexistent/mirror/root"));
        assert!(matches!(
            engine.start(config).await,
            Err(EngineError::Watch(_))
        ));
    }

    #[tokio::test]
    async fn file_change_flows_through_to_sync_events() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, hub) = engine();
        let session = engine.start(fast_config(dir.path())).await.unwrap();
        let session_id = session.session_id;

        // Observer connects first; replay plus live events arrive on rx.
        let (_conn, mut rx) = hub.register(session_id);

        tokio::fs::write(dir.path().join("a.txt"), "contents")
            .await
            .unwrap();

        // session started, then SyncStart, then SyncComplete.
        let mut seen = Vec::new();
        for _ in 0..3 {
            let Some((sid, data)) = recv_update(&mut rx).await else {
                panic!("update stream ended early; saw {seen:?}");
            };
            assert_eq!(sid, session_id);
            if let UpdateData::SyncEvent(event) = data {
                seen.push(event.event_type);
            }
        }
        assert_eq!(
            seen,
            vec![
                SyncEventType::StatusChange,
                SyncEventType::SyncStart,
                SyncEventType::SyncComplete,
            ]
        );

        engine.stop(session_id).await.unwrap();
    }

    #[tokio::test]
    async fn empty_force_sync_reports_zero_files() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _hub) = engine();
        let session = engine.start(fast_config(dir.path())).await.unwrap();

        let event = engine.force_sync(session.session_id).await.unwrap();
        assert_eq!(event.files_count, 0);

        engine.stop(session.session_id).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execution_output_reaches_observers() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, hub) = engine();
        let session = engine.start(fast_config(dir.path())).await.unwrap();
        let session_id = session.session_id;
        let (_conn, mut rx) = hub.register(session_id);

        let exec_id = engine
            .execute_request(session_id, ExecRequest::new("echo").args(["hi"]))
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut final_status = None;
        while let Some((_, data)) = recv_update(&mut rx).await {
            match &data {
                UpdateData::ExecOutput { exec_id: id, .. } if *id == exec_id => {
                    stdout.extend(data.decode_output().unwrap());
                }
                UpdateData::ExecStatus {
                    exec_id: id,
                    status,
                    exit_code,
                } if *id == exec_id => {
                    final_status = Some((*status, *exit_code));
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(String::from_utf8(stdout).unwrap(), "hi\n");
        assert_eq!(
            final_status,
            Some((mirror_core::ExecStatus::Succeeded, Some(0)))
        );

        engine.stop(session_id).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watcher_failure_cancels_running_executions() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _hub) = engine();
        let session = engine.start(fast_config(dir.path())).await.unwrap();
        let session_id = session.session_id;

        let exec_id = engine
            .execute_request(session_id, ExecRequest::new("sleep").args(["30"]))
            .await
            .unwrap();

        mark_failed(&engine.inner, session_id, "device gone").await;

        let status = engine.get_status(session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);

        // Cancel on an already-terminal execution just returns the
        // snapshot the teardown left behind.
        let snapshot = engine.cancel_execution(session_id, exec_id).await.unwrap();
        assert_eq!(snapshot.exit_status, mirror_core::ExecStatus::Cancelled);
    }

    #[tokio::test]
    async fn force_sync_action_acknowledges_empty_windows() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, hub) = engine();
        let session = engine.start(fast_config(dir.path())).await.unwrap();
        let session_id = session.session_id;
        let (conn, mut rx) = hub.register(session_id);

        hub.forward(
            conn,
            ClientMessage::ComponentAction {
                session_id,
                action: ActionKind::ForceSync,
                parameters: Value::Null,
            },
        );

        // The replay pump delivers the startup event first; the
        // empty-window acknowledgement follows on the same connection.
        loop {
            let Some((sid, data)) = recv_update(&mut rx).await else {
                panic!("no force-sync acknowledgement arrived");
            };
            assert_eq!(sid, session_id);
            if let UpdateData::SyncEvent(event) = data {
                if event.event_type == SyncEventType::SyncComplete {
                    assert_eq!(event.files_count, 0);
                    break;
                }
            }
        }

        engine.stop(session_id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_observers_skips_the_grace_wait() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _hub) = engine();
        let mut config = fast_config(dir.path());
        config.stop_grace_ms = 2_000;
        let session = engine.start(config).await.unwrap();

        let started = std::time::Instant::now();
        engine.stop(session.session_id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unknown_session_operations_fail() {
        let (engine, _hub) = engine();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            engine.force_sync(ghost).await,
            Err(EngineError::SessionNotFound(_))
        ));
        assert!(matches!(
            engine.stop(ghost).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
