use std::path::PathBuf;

use crate::types::TaskId;

/// Failures that abort before the control loop starts. These are the only
/// errors that reach the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to unlock vault at {path}: {reason}")]
    VaultUnlock { path: PathBuf, reason: String },
    #[error("failed to load workspace {path}: {source}")]
    WorkspaceLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to construct {name}: {reason}")]
    Collaborator { name: &'static str, reason: String },
}

/// Errors raised while executing a single tool call. The registry turns
/// every one of them into a failed tool outcome.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("a worker is already running ({active}); only one delegated task is allowed at a time")]
    AdmissionRejected { active: TaskId },
    #[error("path '{path}' is outside the workspace {root}")]
    SandboxViolation { path: String, root: PathBuf },
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch worker: {0}")]
    Spawn(String),
}

impl ToolError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::SandboxViolation { .. } => "sandbox_violation",
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArgs(_) => "invalid_args",
            Self::Io { .. } => "io",
            Self::Spawn(_) => "spawn",
        }
    }
}

/// Decision engine failures. Only `Fatal` ends the control loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("decision engine error: {0}")]
    Transient(String),
    #[error("decision engine unavailable: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::ToolError;
    use crate::types::TaskId;

    #[test]
    fn admission_message_names_active_task() {
        let err = ToolError::AdmissionRejected {
            active: TaskId::from("worker-1"),
        };
        assert!(err.to_string().contains("worker-1"));
        assert_eq!(err.kind(), "admission_rejected");
    }
}
