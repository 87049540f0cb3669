use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_WORKER_TIMEOUT;

/// One event taken off the control loop's `select!`.
#[derive(Debug)]
pub enum EventEnvelope {
    InboundMessage(InboundMessage),
    FileChangeSignal,
    HeartbeatTick,
    WorkerCompletion(WorkerResult),
    ShutdownRequested,
}

impl EventEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InboundMessage(_) => "inbound_message",
            Self::FileChangeSignal => "file_change",
            Self::HeartbeatTick => "heartbeat_tick",
            Self::WorkerCompletion(_) => "worker_completion",
            Self::ShutdownRequested => "shutdown_requested",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            sender: sender.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// `worker-<utc timestamp>-<random suffix>`
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{stamp}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to launch one delegated worker process.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: TaskId,
    /// Isolated workspace root; the worker's path guard is rooted here.
    pub workspace: PathBuf,
    pub binary: PathBuf,
    pub config_path: Option<PathBuf>,
    pub vault_path: Option<PathBuf>,
    pub timeout: Duration,
    pub spawned_at: Instant,
    /// Chat that asked for the work; the completion is delivered there.
    pub reply_to: Option<String>,
}

impl WorkerTask {
    pub fn new(id: TaskId, workspace: PathBuf, binary: PathBuf) -> Self {
        Self {
            id,
            workspace,
            binary,
            config_path: None,
            vault_path: None,
            timeout: DEFAULT_WORKER_TIMEOUT,
            spawned_at: Instant::now(),
            reply_to: None,
        }
    }

    /// Zero means "unset" and falls back to the default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_WORKER_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn result_path(&self) -> PathBuf {
        self.workspace.join(RESULT_FILE)
    }
}

pub const RESULT_FILE: &str = "result.md";
pub const TASK_FILE: &str = "task.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub success: bool,
    /// Contents of `result.md`, `None` when the worker produced no result.
    pub output: Option<String>,
    pub error: Option<String>,
    pub outcome: WorkerOutcome,
    pub reply_to: Option<String>,
    pub elapsed: Duration,
}

impl WorkerResult {
    pub fn summary(&self) -> String {
        match (self.success, &self.output, &self.error) {
            (true, Some(output), _) => output.trim().to_string(),
            (true, None, _) => "worker finished without producing a result".to_string(),
            (false, _, Some(error)) => format!("worker failed: {error}"),
            (false, _, None) => "worker failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::{TaskId, WorkerOutcome, WorkerResult, WorkerTask};
    use crate::config::DEFAULT_WORKER_TIMEOUT;

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert!(a.as_str().starts_with("worker-"));
        assert_ne!(a, b);
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let task = WorkerTask::new(TaskId::from("t"), PathBuf::from("/ws"), PathBuf::from("bin"))
            .with_timeout(Duration::ZERO);
        assert_eq!(task.timeout, DEFAULT_WORKER_TIMEOUT);
        assert_eq!(task.result_path(), PathBuf::from("/ws/result.md"));
    }

    #[test]
    fn summary_prefers_output_then_error() {
        let mut result = WorkerResult {
            task_id: TaskId::from("t"),
            success: true,
            output: Some("  done\n".into()),
            error: None,
            outcome: WorkerOutcome::Completed,
            reply_to: None,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(result.summary(), "done");

        result.success = false;
        result.error = Some("timed out after 100ms".into());
        assert_eq!(result.summary(), "worker failed: timed out after 100ms");
    }
}
