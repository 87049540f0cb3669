//! The seam to the language-model decision loop.
//!
//! The runtime never interprets messages itself: a [`DecisionEngine`] turns
//! a trigger plus the workspace into a reply and/or tool calls. [`run_turn`]
//! executes those tool calls strictly one after another and feeds their
//! outcomes back until the engine stops asking for tools.

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    error::{EngineError, StartupError},
    secrets::SecretSnapshot,
    tools::{ToolCall, ToolContext, ToolOutcome, ToolRegistry, ToolSpec},
    workspace::WorkspaceSnapshot,
};

const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Message {
        chat_id: String,
        sender: String,
        text: String,
    },
    Heartbeat,
    /// A delegated task, in worker mode.
    Task { task: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub outcome: ToolOutcome,
}

#[derive(Debug, Serialize)]
pub struct DecisionRequest<'a> {
    pub trigger: &'a Trigger,
    pub workspace: &'a BTreeMap<String, String>,
    pub tools: &'a [ToolSpec],
    pub tool_results: &'a [ToolExchange],
    pub round: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Decision {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tools(calls: Vec<ToolCall>) -> Self {
        Self {
            reply: None,
            tool_calls: calls,
        }
    }
}

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision, EngineError>;
}

#[derive(Debug, Default)]
pub struct TurnOutput {
    pub reply: Option<String>,
    pub exchanges: Vec<ToolExchange>,
    pub reload_requested: bool,
    pub rounds: u32,
}

/// One full decision turn. Tool calls run sequentially in the order the
/// engine returned them; the turn ends when a decision carries no tool
/// calls or after `max_rounds` decisions.
pub async fn run_turn(
    engine: &dyn DecisionEngine,
    registry: &ToolRegistry,
    workspace: &WorkspaceSnapshot,
    trigger: &Trigger,
    ctx: &ToolContext,
    max_rounds: u32,
) -> Result<TurnOutput, EngineError> {
    let tools = registry.describe();
    let mut turn = TurnOutput::default();

    for round in 1..=max_rounds.max(1) {
        turn.rounds = round;
        let decision = engine
            .decide(&DecisionRequest {
                trigger,
                workspace: &workspace.files,
                tools: &tools,
                tool_results: &turn.exchanges,
                round,
            })
            .await?;

        if decision.reply.is_some() {
            turn.reply = decision.reply;
        }
        if decision.tool_calls.is_empty() {
            return Ok(turn);
        }

        for call in decision.tool_calls {
            let outcome = registry.execute(&call, ctx).await;
            turn.reload_requested |= outcome.reload_workspace;
            turn.exchanges.push(ToolExchange { call, outcome });
        }
    }

    tracing::warn!(
        target = "burrow::agent",
        rounds = turn.rounds,
        tool_calls = turn.exchanges.len(),
        "tool round limit reached, ending turn"
    );
    Ok(turn)
}

/// Runs an external program per decision: the request goes to its stdin as
/// JSON, the decision comes back on stdout as JSON. Plain-text output is
/// taken as a reply.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    call_timeout: Duration,
}

impl CommandEngine {
    pub fn from_command_line(line: &str, secrets: &SecretSnapshot) -> Result<Self, StartupError> {
        let reject = |reason: String| StartupError::Collaborator {
            name: "decision engine",
            reason,
        };
        let mut parts = shlex::split(line)
            .ok_or_else(|| reject(format!("cannot parse engine command '{line}'")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| reject("engine command is empty".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            env: secrets.env_vars(),
            call_timeout: ENGINE_CALL_TIMEOUT,
        })
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

#[async_trait]
impl DecisionEngine for CommandEngine {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision, EngineError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| EngineError::Transient(format!("failed encoding request: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                EngineError::Fatal(format!("cannot run '{}': {e}", self.program))
            }
            _ => EngineError::Transient(format!("failed to start '{}': {e}", self.program)),
        })?;

        // The engine may never read its stdin, so the write shares the
        // deadline with the wait.
        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                stdin
                    .write_all(&payload)
                    .await
                    .map_err(|e| EngineError::Transient(format!("failed writing request: {e}")))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| EngineError::Transient(format!("engine failed: {e}")))
        };
        let output = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| {
                EngineError::Transient(format!("engine timed out after {:?}", self.call_timeout))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Transient(format!(
                "engine exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_decision(&output.stdout)
    }
}

fn parse_decision(stdout: &[u8]) -> Result<Decision, EngineError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Decision::default());
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| EngineError::Transient(format!("malformed engine decision: {e}")));
    }
    Ok(Decision::reply(trimmed))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::{parse_decision, run_turn, Decision, DecisionEngine, DecisionRequest, Trigger};
    use crate::{
        error::EngineError,
        tools::{RegistryKind, ToolCall, ToolContext, ToolRegistry},
        workspace::WorkspaceSnapshot,
    };

    /// Replays canned decisions and records how many tool results each
    /// request carried.
    struct Scripted {
        decisions: Mutex<Vec<Decision>>,
        seen_results: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(mut decisions: Vec<Decision>) -> Arc<Self> {
            decisions.reverse();
            Arc::new(Self {
                decisions: Mutex::new(decisions),
                seen_results: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DecisionEngine for Scripted {
        async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision, EngineError> {
            self.seen_results.lock().push(request.tool_results.len());
            Ok(self.decisions.lock().pop().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn tool_results_feed_next_round() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::build(dir.path(), RegistryKind::Restricted);
        let workspace = WorkspaceSnapshot::empty(dir.path());
        let engine = Scripted::new(vec![
            Decision::tools(vec![ToolCall::new(
                "write_file",
                json!({"path": "a.md", "content": "x"}),
            )]),
            Decision::reply("done"),
        ]);

        let turn = run_turn(
            engine.as_ref(),
            &registry,
            &workspace,
            &Trigger::Heartbeat,
            &ToolContext::default(),
            4,
        )
        .await
        .unwrap();

        assert_eq!(turn.reply.as_deref(), Some("done"));
        assert_eq!(turn.rounds, 2);
        assert_eq!(*engine.seen_results.lock(), vec![0, 1]);
        assert!(dir.path().join("a.md").exists());
    }

    #[tokio::test]
    async fn round_limit_ends_turn() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::build(dir.path(), RegistryKind::Restricted);
        let workspace = WorkspaceSnapshot::empty(dir.path());
        let looping = Decision::tools(vec![ToolCall::new("list_dir", json!({}))]);
        let engine = Scripted::new(vec![looping.clone(), looping.clone(), looping]);

        let turn = run_turn(
            engine.as_ref(),
            &registry,
            &workspace,
            &Trigger::Heartbeat,
            &ToolContext::default(),
            2,
        )
        .await
        .unwrap();
        assert_eq!(turn.rounds, 2);
        assert_eq!(turn.exchanges.len(), 2);
        assert!(turn.reply.is_none());
    }

    #[test]
    fn plain_text_output_is_a_reply() {
        assert_eq!(parse_decision(b"  hello\n").unwrap(), Decision::reply("hello"));
        assert_eq!(parse_decision(b"").unwrap(), Decision::default());
        let parsed = parse_decision(
            br#"{"tool_calls":[{"name":"read_file","args":{"path":"a.md"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.tool_calls[0].name, "read_file");
        assert!(parse_decision(b"{broken").is_err());
    }

    #[test]
    fn trigger_serializes_with_kind_tag() {
        let value = serde_json::to_value(Trigger::Task {
            task: "summarize".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"kind": "task", "task": "summarize"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_that_never_reads_stdin_times_out() {
        use std::{collections::BTreeMap, time::{Duration, Instant}};

        use super::CommandEngine;
        use crate::secrets::SecretSnapshot;

        let engine = CommandEngine::from_command_line("sleep 30", &SecretSnapshot::default())
            .unwrap()
            .with_call_timeout(Duration::from_millis(200));
        // Larger than any pipe buffer, so the write cannot complete.
        let mut files = BTreeMap::new();
        files.insert("AGENTS.md".to_string(), "x".repeat(4 * 1024 * 1024));

        let started = Instant::now();
        let err = engine
            .decide(&DecisionRequest {
                trigger: &Trigger::Heartbeat,
                workspace: &files,
                tools: &[],
                tool_results: &[],
                round: 1,
            })
            .await
            .unwrap_err();

        assert!(matches!(&err, EngineError::Transient(reason) if reason.contains("timed out")), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
