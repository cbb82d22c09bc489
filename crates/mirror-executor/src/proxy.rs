//! Proxied command execution.
//!
//! Spawns external processes in their own process group, captures output
//! concurrently into an [`OutputStore`], and enforces per-execution
//! watchdog timeouts. Execution handles return immediately; state is
//! queried through snapshots.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use command_group::AsyncCommandGroup;
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncReadExt,
    sync::{RwLock, oneshot, watch},
};
use uuid::Uuid;

use mirror_core::{ExecStatus, SessionId};
use mirror_platform::{PlatformError, resolve_invocation};

use crate::capture::OutputStore;

/// Execution error.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("Working directory does not exist: {}", .0.display())]
    WorkingDirMissing(PathBuf),
    #[error("Execution not found: {0}")]
    NotFound(Uuid),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request to run one external command.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Command name, may carry embedded arguments.
    pub command: String,
    /// Additional arguments.
    pub args: Vec<String>,
    /// Working directory; the platform default when `None`.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Watchdog timeout; the proxy default when `None`.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Request for a bare command.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the watchdog timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Read-only view of one execution's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Unique execution identifier. Never reused.
    pub exec_id: Uuid,
    /// Owning mirror session.
    pub session_id: SessionId,
    /// Command as requested.
    pub command: String,
    /// Resolved argument vector.
    pub args: Vec<String>,
    /// Effective working directory.
    pub working_dir: PathBuf,
    /// When the process was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub exit_status: ExecStatus,
    /// Process exit code, when it exited on its own.
    pub exit_code: Option<i32>,
}

/// Handle returned by [`CommandExecutionProxy::execute`].
#[derive(Clone)]
pub struct ExecHandle {
    /// Execution identifier for later status/cancel calls.
    pub exec_id: Uuid,
    /// Output buffer, live from the moment of spawn.
    pub output: Arc<OutputStore>,
    status_rx: watch::Receiver<ExecStatus>,
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle")
            .field("exec_id", &self.exec_id)
            .field("status", &*self.status_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl ExecHandle {
    /// Wait until the execution reaches a terminal state.
    pub async fn wait_terminal(&self) -> ExecStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Current status without waiting.
    #[must_use]
    pub fn status(&self) -> ExecStatus {
        *self.status_rx.borrow()
    }
}

struct ExecEntry {
    snapshot: ExecutionSnapshot,
    output: Arc<OutputStore>,
    cancel_tx: Option<oneshot::Sender<()>>,
    status_rx: watch::Receiver<ExecStatus>,
}

/// Launches external processes and tracks their executions.
pub struct CommandExecutionProxy {
    executions: Arc<RwLock<HashMap<Uuid, ExecEntry>>>,
    output_buffer_bytes: usize,
    default_timeout: Option<Duration>,
}

impl CommandExecutionProxy {
    /// Create a proxy with the given per-execution output cap.
    #[must_use]
    pub fn new(output_buffer_bytes: usize, default_timeout: Option<Duration>) -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            output_buffer_bytes,
            default_timeout,
        }
    }

    /// Start an execution and return its handle immediately.
    ///
    /// Output capture and the watchdog run concurrently; the caller
    /// observes progress through the handle or [`Self::get_status`].
    ///
    /// # Errors
    /// Fails fast, creating no execution state, if the command cannot be
    /// resolved or the working directory does not exist.
    pub async fn execute(
        &self,
        session_id: SessionId,
        request: ExecRequest,
    ) -> Result<ExecHandle, ExecError> {
        let invocation = resolve_invocation(&request.command, &request.args).await?;
        let working_dir = request
            .working_dir
            .clone()
            .unwrap_or_else(|| invocation.default_cwd.clone());
        if !working_dir.is_dir() {
            return Err(ExecError::WorkingDirMissing(working_dir));
        }

        let exec_id = Uuid::new_v4();
        let output = Arc::new(OutputStore::new(self.output_buffer_bytes));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(ExecStatus::Pending);
        let timeout = request.timeout.or(self.default_timeout);

        let snapshot = ExecutionSnapshot {
            exec_id,
            session_id,
            command: request.command.clone(),
            args: invocation.args.clone(),
            working_dir: working_dir.clone(),
            started_at: None,
            ended_at: None,
            exit_status: ExecStatus::Pending,
            exit_code: None,
        };

        self.executions.write().await.insert(
            exec_id,
            ExecEntry {
                snapshot,
                output: Arc::clone(&output),
                cancel_tx: Some(cancel_tx),
                status_rx: status_rx.clone(),
            },
        );

        tracing::info!(%exec_id, command = %request.command, "Starting execution");

        tokio::spawn(run_execution(
            Arc::clone(&self.executions),
            exec_id,
            invocation.program,
            invocation.args,
            working_dir,
            request.env,
            timeout,
            Arc::clone(&output),
            cancel_rx,
            status_tx,
        ));

        Ok(ExecHandle {
            exec_id,
            output,
            status_rx,
        })
    }

    /// Cancel an execution.
    ///
    /// Idempotent: cancelling an already-terminal execution returns the
    /// existing terminal snapshot unchanged.
    ///
    /// # Errors
    /// Returns [`ExecError::NotFound`] for unknown ids.
    pub async fn cancel(&self, exec_id: Uuid) -> Result<ExecutionSnapshot, ExecError> {
        let status_rx = {
            let mut executions = self.executions.write().await;
            let entry = executions
                .get_mut(&exec_id)
                .ok_or(ExecError::NotFound(exec_id))?;
            if entry.snapshot.exit_status.is_terminal() {
                return Ok(entry.snapshot.clone());
            }
            if let Some(tx) = entry.cancel_tx.take() {
                let _ = tx.send(());
            }
            entry.status_rx.clone()
        };

        // Bounded wait for the runner to finish tearing the process down.
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            let mut rx = status_rx;
            while !rx.borrow().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        self.get_status(exec_id).await
    }

    /// Cancel every non-terminal execution, waiting up to `grace`.
    pub async fn cancel_all(&self, grace: Duration) {
        let pending: Vec<Uuid> = {
            let mut executions = self.executions.write().await;
            executions
                .iter_mut()
                .filter(|(_, e)| !e.snapshot.exit_status.is_terminal())
                .map(|(id, entry)| {
                    if let Some(tx) = entry.cancel_tx.take() {
                        let _ = tx.send(());
                    }
                    *id
                })
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + grace;
        for exec_id in pending {
            let Ok(entry_rx) = self.status_channel(exec_id).await else {
                continue;
            };
            let mut rx = entry_rx;
            let _ = tokio::time::timeout_at(deadline, async {
                while !rx.borrow().is_terminal() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    /// Snapshot of one execution.
    ///
    /// # Errors
    /// Returns [`ExecError::NotFound`] for unknown ids.
    pub async fn get_status(&self, exec_id: Uuid) -> Result<ExecutionSnapshot, ExecError> {
        self.executions
            .read()
            .await
            .get(&exec_id)
            .map(|e| e.snapshot.clone())
            .ok_or(ExecError::NotFound(exec_id))
    }

    /// The output store for an execution, if it is still retained.
    pub async fn output(&self, exec_id: Uuid) -> Option<Arc<OutputStore>> {
        self.executions
            .read()
            .await
            .get(&exec_id)
            .map(|e| Arc::clone(&e.output))
    }

    /// Snapshots of all retained executions, newest first.
    pub async fn list(&self) -> Vec<ExecutionSnapshot> {
        let mut all: Vec<ExecutionSnapshot> = self
            .executions
            .read()
            .await
            .values()
            .map(|e| e.snapshot.clone())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Number of executions that have not reached a terminal state.
    pub async fn active_count(&self) -> usize {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| !e.snapshot.exit_status.is_terminal())
            .count()
    }

    /// Drop a terminal execution and its output buffer.
    ///
    /// # Errors
    /// Returns [`ExecError::NotFound`] for unknown ids; running
    /// executions are left in place.
    pub async fn remove(&self, exec_id: Uuid) -> Result<(), ExecError> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get(&exec_id)
            .ok_or(ExecError::NotFound(exec_id))?;
        if entry.snapshot.exit_status.is_terminal() {
            executions.remove(&exec_id);
        }
        Ok(())
    }

    async fn status_channel(&self, exec_id: Uuid) -> Result<watch::Receiver<ExecStatus>, ExecError> {
        self.executions
            .read()
            .await
            .get(&exec_id)
            .map(|e| e.status_rx.clone())
            .ok_or(ExecError::NotFound(exec_id))
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

#[allow(clippy::too_many_arguments)]
async fn run_execution(
    executions: Arc<RwLock<HashMap<Uuid, ExecEntry>>>,
    exec_id: Uuid,
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
    output: Arc<OutputStore>,
    cancel_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<ExecStatus>,
) {
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&args)
        .current_dir(&working_dir)
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.group_spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(%exec_id, %err, "Spawn failed");
            output.append_stderr(format!("spawn failed: {err}").into_bytes());
            finalize(&executions, exec_id, &status_tx, &output, ExecStatus::Failed, None).await;
            return;
        }
    };

    set_running(&executions, exec_id, &status_tx).await;

    let stdout = child.inner().stdout.take();
    let stderr = child.inner().stderr.take();
    let mut pumps = Vec::new();
    if let Some(stdout) = stdout {
        pumps.push(tokio::spawn(pump(stdout, Arc::clone(&output), false)));
    }
    if let Some(stderr) = stderr {
        pumps.push(tokio::spawn(pump(stderr, Arc::clone(&output), true)));
    }

    let mut cancel_rx = cancel_rx;
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = &mut cancel_rx => Outcome::Cancelled,
        () = sleep_opt(timeout), if timeout.is_some() => Outcome::TimedOut,
    };

    let (status, exit_code) = match outcome {
        Outcome::Exited(Ok(exit)) => {
            let code = exit.code();
            if exit.success() {
                (ExecStatus::Succeeded, code)
            } else {
                (ExecStatus::Failed, code)
            }
        }
        Outcome::Exited(Err(err)) => {
            tracing::error!(%exec_id, %err, "Wait failed");
            (ExecStatus::Failed, None)
        }
        Outcome::Cancelled => {
            tracing::info!(%exec_id, "Execution cancelled, killing process group");
            kill_and_reap(&mut child).await;
            (ExecStatus::Cancelled, None)
        }
        Outcome::TimedOut => {
            tracing::warn!(%exec_id, ?timeout, "Watchdog expired, killing process group");
            kill_and_reap(&mut child).await;
            (ExecStatus::Timeout, None)
        }
    };

    // Let the pumps drain whatever the process wrote before it died.
    for pump_task in pumps {
        let _ = pump_task.await;
    }

    finalize(&executions, exec_id, &status_tx, &output, status, exit_code).await;
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

async fn kill_and_reap(child: &mut command_group::AsyncGroupChild) {
    if let Err(err) = child.start_kill() {
        tracing::debug!(%err, "Kill failed, process may have already exited");
    }
    let _ = child.wait().await;
}

async fn set_running(
    executions: &Arc<RwLock<HashMap<Uuid, ExecEntry>>>,
    exec_id: Uuid,
    status_tx: &watch::Sender<ExecStatus>,
) {
    let mut guard = executions.write().await;
    if let Some(entry) = guard.get_mut(&exec_id) {
        entry.snapshot.exit_status = ExecStatus::Running;
        entry.snapshot.started_at = Some(Utc::now());
    }
    let _ = status_tx.send(ExecStatus::Running);
}

async fn finalize(
    executions: &Arc<RwLock<HashMap<Uuid, ExecEntry>>>,
    exec_id: Uuid,
    status_tx: &watch::Sender<ExecStatus>,
    output: &OutputStore,
    status: ExecStatus,
    exit_code: Option<i32>,
) {
    output.finish(status);
    {
        let mut guard = executions.write().await;
        if let Some(entry) = guard.get_mut(&exec_id) {
            entry.snapshot.exit_status = status;
            entry.snapshot.exit_code = exit_code;
            entry.snapshot.ended_at = Some(Utc::now());
            entry.cancel_tx = None;
        }
    }
    let _ = status_tx.send(status);
    tracing::info!(%exec_id, ?status, exit_code, "Execution finished");
}

async fn pump(
    reader: impl tokio::io::AsyncRead + Unpin,
    store: Arc<OutputStore>,
    is_stderr: bool,
) {
    let mut reader = reader;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = bytes::Bytes::copy_from_slice(&buf[..n]);
                if is_stderr {
                    store.append_stderr(data);
                } else {
                    store.append_stdout(data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::capture::OutputFormat;

    fn proxy() -> CommandExecutionProxy {
        CommandExecutionProxy::new(1024 * 1024, None)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_succeeds_and_streams_stdout() {
        let proxy = proxy();
        let handle = proxy
            .execute(
                Uuid::new_v4(),
                ExecRequest::new("echo")
                    .args(["hello"])
                    .timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(handle.wait_terminal().await, ExecStatus::Succeeded);

        let chunks: Vec<bytes::Bytes> = handle.output.stream(OutputFormat::Raw).collect().await;
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert_eq!(text, "hello\n");

        let snapshot = proxy.get_status(handle.exec_id).await.unwrap();
        assert_eq!(snapshot.exit_status, ExecStatus::Succeeded);
        assert_eq!(snapshot.exit_code, Some(0));
        assert!(snapshot.ended_at.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let proxy = proxy();
        let handle = proxy
            .execute(Uuid::new_v4(), ExecRequest::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap();

        assert_eq!(handle.wait_terminal().await, ExecStatus::Failed);
        let snapshot = proxy.get_status(handle.exec_id).await.unwrap();
        assert_eq!(snapshot.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watchdog_times_out_long_commands() {
        let proxy = proxy();
        let started = tokio::time::Instant::now();
        let handle = proxy
            .execute(
                Uuid::new_v4(),
                ExecRequest::new("sleep")
                    .args(["30"])
                    .timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert_eq!(handle.wait_terminal().await, ExecStatus::Timeout);
        // Watchdog slack: well under the command's own duration.
        assert!(started.elapsed() < Duration::from_secs(5));

        let snapshot = proxy.get_status(handle.exec_id).await.unwrap();
        assert_eq!(snapshot.exit_status, ExecStatus::Timeout);
        assert!(snapshot.ended_at.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn double_cancel_returns_identical_snapshot() {
        let proxy = proxy();
        let handle = proxy
            .execute(Uuid::new_v4(), ExecRequest::new("sleep").args(["30"]))
            .await
            .unwrap();

        let first = proxy.cancel(handle.exec_id).await.unwrap();
        assert_eq!(first.exit_status, ExecStatus::Cancelled);

        let second = proxy.cancel(handle.exec_id).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn unknown_command_fails_fast_with_no_state() {
        let proxy = proxy();
        let err = proxy
            .execute(
                Uuid::new_v4(),
                ExecRequest::new("definitely-not-a-real-binary-0xdead"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Platform(_)));
        assert!(proxy.list().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_working_dir_fails_fast() {
        let proxy = proxy();
        let err = proxy
            .execute(
                Uuid::new_v4(),
                ExecRequest::new("echo").working_dir("/nonexistent/mirror/workdir"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::WorkingDirMissing(_)));
        assert!(proxy.list().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn remove_drops_only_terminal_executions() {
        let proxy = proxy();
        let handle = proxy
            .execute(Uuid::new_v4(), ExecRequest::new("echo").args(["x"]))
            .await
            .unwrap();
        handle.wait_terminal().await;

        proxy.remove(handle.exec_id).await.unwrap();
        assert!(matches!(
            proxy.get_status(handle.exec_id).await,
            Err(ExecError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_all_terminates_running_executions() {
        let proxy = proxy();
        let a = proxy
            .execute(Uuid::new_v4(), ExecRequest::new("sleep").args(["30"]))
            .await
            .unwrap();
        let b = proxy
            .execute(Uuid::new_v4(), ExecRequest::new("sleep").args(["30"]))
            .await
            .unwrap();

        proxy.cancel_all(Duration::from_secs(5)).await;

        assert_eq!(
            proxy.get_status(a.exec_id).await.unwrap().exit_status,
            ExecStatus::Cancelled
        );
        assert_eq!(
            proxy.get_status(b.exec_id).await.unwrap().exit_status,
            ExecStatus::Cancelled
        );
        assert_eq!(proxy.active_count().await, 0);
    }
}
