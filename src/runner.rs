//! Supervision of the single delegated worker process.
//!
//! Admission is capacity one: the active task id lives in a `watch`
//! channel, claimed and released under the channel's lock. A second spawn
//! while a task is active is rejected synchronously. Each admitted worker
//! gets one supervising task that races process exit against the task
//! timeout and the runtime's cancellation, then reports a [`WorkerResult`]
//! on a capacity-one completion channel.

use std::{io::ErrorKind, path::Path, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, watch},
    time::timeout,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};

use crate::{
    config::{PASSPHRASE_ENV, TERMINATE_GRACE},
    context::RuntimeContext,
    error::ToolError,
    types::{TaskId, WorkerOutcome, WorkerResult, WorkerTask},
};

/// Starts the OS process for a task. Injected so tests can launch plain
/// shell commands instead of the runtime binary.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, task: &WorkerTask) -> Result<Child>;
}

/// Re-executes the runtime binary in worker mode.
#[derive(Default)]
pub struct ProcessLauncher {
    passphrase: Option<String>,
}

impl ProcessLauncher {
    /// `passphrase` is forwarded through the environment so the worker can
    /// unlock the vault without prompting.
    pub fn new(passphrase: Option<String>) -> Self {
        Self { passphrase }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, task: &WorkerTask) -> Result<Child> {
        let mut cmd = Command::new(&task.binary);
        cmd.arg("worker")
            .arg("--workspace")
            .arg(&task.workspace)
            .arg("--timeout-secs")
            .arg(task.timeout.as_secs().max(1).to_string());
        if let Some(config) = &task.config_path {
            cmd.arg("--config").arg(config);
        }
        if let Some(vault) = &task.vault_path {
            cmd.arg("--vault").arg(vault);
        }
        if let Some(passphrase) = &self.passphrase {
            cmd.env(PASSPHRASE_ENV, passphrase);
        }

        cmd.current_dir(&task.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        cmd.spawn()
            .with_context(|| format!("failed to spawn worker {}", task.id))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("worker {task_id} was still running when the wait ended")]
pub struct WaitCancelled {
    pub task_id: TaskId,
}

#[derive(Clone)]
pub struct WorkerRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    active: watch::Sender<Option<TaskId>>,
    results_tx: mpsc::Sender<WorkerResult>,
    launcher: Arc<dyn WorkerLauncher>,
    ctx: RuntimeContext,
    grace: Duration,
}

impl WorkerRunner {
    /// Returns the runner and the receiving end of its completion channel.
    /// Cancelling `ctx` stops any running worker.
    pub fn new(
        ctx: &RuntimeContext,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> (Self, mpsc::Receiver<WorkerResult>) {
        Self::with_grace(ctx, launcher, TERMINATE_GRACE)
    }

    pub fn with_grace(
        ctx: &RuntimeContext,
        launcher: Arc<dyn WorkerLauncher>,
        grace: Duration,
    ) -> (Self, mpsc::Receiver<WorkerResult>) {
        // Capacity one: admission guarantees at most one pending result.
        let (results_tx, results_rx) = mpsc::channel(1);
        let (active, _) = watch::channel(None);
        let runner = Self {
            inner: Arc::new(RunnerInner {
                active,
                results_tx,
                launcher,
                ctx: ctx.child(),
                grace,
            }),
        };
        (runner, results_rx)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.borrow().is_some()
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.inner.active.borrow().clone()
    }

    /// Admits and launches `task`, or rejects it immediately if another
    /// worker holds the slot. Must be called from within a tokio runtime.
    pub fn spawn(&self, task: WorkerTask) -> Result<(), ToolError> {
        let mut occupant = None;
        let claimed = self.inner.active.send_if_modified(|slot| match slot {
            Some(active) => {
                occupant = Some(active.clone());
                false
            }
            None => {
                *slot = Some(task.id.clone());
                true
            }
        });
        if let Some(active) = occupant.filter(|_| !claimed) {
            tracing::info!(target = "burrow::runner", requested = %task.id, active = %active, "worker admission rejected");
            return Err(ToolError::AdmissionRejected { active });
        }

        let child = match self.inner.launcher.launch(&task) {
            Ok(child) => child,
            Err(error) => {
                self.release(&task.id);
                tracing::error!(target = "burrow::runner", task_id = %task.id, error = %error, "worker launch failed");
                return Err(ToolError::Spawn(format!("{error:#}")));
            }
        };

        tracing::info!(
            target = "burrow::runner",
            task_id = %task.id,
            pid = ?child.id(),
            timeout_ms = task.timeout.as_millis() as u64,
            workspace = %task.workspace.display(),
            "worker running"
        );
        tokio::spawn(supervise(self.inner.clone(), task, child));
        Ok(())
    }

    /// Frees the admission slot if `task_id` still holds it. Returns
    /// whether anything changed.
    pub fn release(&self, task_id: &TaskId) -> bool {
        self.inner.active.send_if_modified(|slot| {
            if slot.as_ref() == Some(task_id) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }

    /// Blocks until no worker is active or `ctx` is done.
    pub async fn wait_for_completion(&self, ctx: &RuntimeContext) -> Result<(), WaitCancelled> {
        let mut rx = self.inner.active.subscribe();
        let idle = async move { rx.wait_for(|slot| slot.is_none()).await.is_ok() };

        tokio::select! {
            drained = idle => {
                if drained {
                    return Ok(());
                }
            }
            _ = ctx.done() => {}
        }

        match self.active_task() {
            Some(task_id) => Err(WaitCancelled { task_id }),
            None => Ok(()),
        }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn supervise(inner: Arc<RunnerInner>, task: WorkerTask, mut child: Child) {
    // Combined deadline: the task's own timeout or runtime cancellation,
    // whichever fires first.
    let token = inner.ctx.token();
    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep(task.timeout) => Waited::TimedOut,
        _ = token.cancelled() => Waited::Cancelled,
    };

    let (outcome, error) = match waited {
        Waited::Exited(Ok(status)) if status.success() => (WorkerOutcome::Completed, None),
        Waited::Exited(Ok(status)) => (WorkerOutcome::Completed, Some(describe_exit(&status))),
        Waited::Exited(Err(error)) => (
            WorkerOutcome::Completed,
            Some(format!("failed waiting for worker: {error}")),
        ),
        Waited::TimedOut => {
            tracing::warn!(target = "burrow::runner", task_id = %task.id, timeout_ms = task.timeout.as_millis() as u64, "worker timed out, terminating");
            terminate_child(&mut child, inner.grace).await;
            (
                WorkerOutcome::TimedOut,
                Some(format!("worker timed out after {:?}", task.timeout)),
            )
        }
        Waited::Cancelled => {
            tracing::info!(target = "burrow::runner", task_id = %task.id, "runtime cancelled, terminating worker");
            terminate_child(&mut child, inner.grace).await;
            (
                WorkerOutcome::Cancelled,
                Some("worker cancelled by runtime shutdown".to_string()),
            )
        }
    };

    let result = WorkerResult {
        task_id: task.id.clone(),
        success: error.is_none(),
        output: read_result(&task.result_path()).await,
        error,
        outcome,
        reply_to: task.reply_to.clone(),
        elapsed: task.spawned_at.elapsed(),
    };
    tracing::info!(
        target = "burrow::runner",
        task_id = %result.task_id,
        outcome = ?result.outcome,
        success = result.success,
        has_output = result.output.is_some(),
        elapsed_ms = result.elapsed.as_millis() as u64,
        "worker finished"
    );

    inner.active.send_if_modified(|slot| {
        if slot.as_ref() == Some(&task.id) {
            *slot = None;
            true
        } else {
            false
        }
    });

    // Never block the supervisor on a slow consumer.
    match inner.results_tx.try_send(result) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(result)) => {
            tracing::error!(
                target = "burrow::runner",
                task_id = %result.task_id,
                summary = %result.summary(),
                "completion channel full, dropping worker result"
            );
        }
        Err(mpsc::error::TrySendError::Closed(result)) => {
            tracing::debug!(target = "burrow::runner", task_id = %result.task_id, "completion receiver gone");
        }
    }
}

/// `None` when the worker left no (or an empty) `result.md`.
async fn read_result(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(text),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(error) => {
            tracing::warn!(target = "burrow::runner", path = %path.display(), error = %error, "failed reading worker result");
            None
        }
    }
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return match signal {
                9 => "worker killed by signal 9 (possible OOM)".to_string(),
                11 => "worker crashed with a segmentation fault".to_string(),
                other => format!("worker killed by signal {other}"),
            };
        }
    }
    match status.code() {
        Some(137) => "worker exited with code 137 (likely OOM killed)".to_string(),
        Some(code) => format!("worker exited with code {code}"),
        None => "worker exited with unknown status".to_string(),
    }
}

/// SIGTERM (to the worker's process group when it leads one), then SIGKILL
/// once `grace` has passed.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            if killpg(pid, Signal::SIGTERM).is_err() {
                let _ = kill(pid, Signal::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let pid = Pid::from_raw(pid as i32);
                if killpg(pid, Signal::SIGKILL).is_err() {
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
        }

        let _ = child.kill().await;
    }
}
