//! Control loop behaviour with stub collaborators.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use burrow::{
    agent::{Decision, DecisionEngine, DecisionRequest, Trigger},
    context::RuntimeContext,
    control::{ControlLoop, LoopInputs, LoopParts},
    error::{EngineError, ToolError},
    events::EventEmitter,
    memory::LogStore,
    source::MessageTransport,
    tools::{RegistryKind, ToolCall, ToolContext, ToolHandler, ToolOutcome, ToolRegistry},
    types::{InboundMessage, TaskId, WorkerOutcome, WorkerResult},
    workspace::{WorkspaceLoader, WorkspaceSnapshot},
};

#[derive(Default)]
struct Outbox(Mutex<Vec<(String, String)>>);

impl Outbox {
    fn sent(&self) -> Vec<(String, String)> {
        self.0.lock().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<(String, String)> {
        for _ in 0..500 {
            if self.0.lock().len() >= count {
                return self.sent();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} replies, got {:?}", self.sent());
    }
}

#[async_trait]
impl MessageTransport for Outbox {
    async fn fetch(&self) -> anyhow::Result<Vec<InboundMessage>> {
        Ok(Vec::new())
    }

    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.0.lock().push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Collects emitted event lines.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for EventLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl EventLog {
    fn of_type(&self, kind: &str) -> Vec<Value> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).unwrap())
            .filter(|event| event["type"] == kind)
            .map(|event| event["payload"].clone())
            .collect()
    }
}

#[derive(Default)]
struct NullLog;

impl LogStore for NullLog {
    fn append(&self, _kind: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Serves `AGENTS.md` with whatever content is set, or fails.
struct SwitchLoader {
    root: PathBuf,
    content: Mutex<Option<String>>,
    loads: AtomicUsize,
}

impl SwitchLoader {
    fn new(root: &Path, content: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            content: Mutex::new(content.map(str::to_string)),
            loads: AtomicUsize::new(0),
        })
    }

    fn set(&self, content: Option<&str>) {
        *self.content.lock() = content.map(str::to_string);
    }
}

impl WorkspaceLoader for SwitchLoader {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self) -> anyhow::Result<WorkspaceSnapshot> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let content = self
            .content
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("AGENTS.md unreadable"))?;
        let mut snapshot = WorkspaceSnapshot::empty(&self.root);
        snapshot.files = BTreeMap::from([("AGENTS.md".to_string(), content)]);
        Ok(snapshot)
    }
}

/// Asks for the `check` tool once per trigger, then replies with the
/// current `AGENTS.md`. Messages reading "fail"/"die" produce transient and
/// fatal errors, "stall" never answers; heartbeats always fail.
struct ScriptedEngine;

#[async_trait]
impl DecisionEngine for ScriptedEngine {
    async fn decide(&self, request: &DecisionRequest<'_>) -> Result<Decision, EngineError> {
        match request.trigger {
            Trigger::Heartbeat => return Err(EngineError::Transient("model overloaded".into())),
            Trigger::Message { text, .. } if text == "fail" => {
                return Err(EngineError::Transient("rate limited".into()))
            }
            Trigger::Message { text, .. } if text == "die" => {
                return Err(EngineError::Fatal("credentials revoked".into()))
            }
            Trigger::Message { text, .. } if text == "stall" => {
                return std::future::pending().await
            }
            _ => {}
        }
        if request.tool_results.is_empty() && request.tools.iter().any(|t| t.name == "check") {
            return Ok(Decision::tools(vec![ToolCall::new("check", json!({}))]));
        }
        let definition = request.workspace.get("AGENTS.md").cloned().unwrap_or_default();
        Ok(Decision::reply(definition))
    }
}

/// Fails the test if two calls ever overlap.
#[derive(Default)]
struct ReentrancyCheck {
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl ToolHandler for ReentrancyCheck {
    fn name(&self) -> &str {
        "check"
    }

    fn description(&self) -> &str {
        "records overlapping calls"
    }

    async fn call(&self, _ctx: &ToolContext, _args: &Value) -> Result<ToolOutcome, ToolError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(ToolOutcome::success("ok"))
    }
}

struct Harness {
    ctx: RuntimeContext,
    inbound: mpsc::Sender<InboundMessage>,
    changes: mpsc::Sender<()>,
    results: mpsc::Sender<WorkerResult>,
    outbox: Arc<Outbox>,
    events: EventLog,
    handle: JoinHandle<(ControlLoop, anyhow::Result<()>)>,
}

fn start(
    root: &Path,
    loader: Arc<SwitchLoader>,
    check: Option<Arc<ReentrancyCheck>>,
    heartbeat: Option<Duration>,
) -> Harness {
    let ctx = RuntimeContext::new();
    let mut registry = ToolRegistry::build(root, RegistryKind::Restricted);
    if let Some(check) = check {
        registry.register(check);
    }
    let outbox = Arc::new(Outbox::default());
    let events = EventLog::default();
    let workspace = loader.load().unwrap();

    let (inbound, inbound_rx) = mpsc::channel(1);
    let (changes, change_rx) = mpsc::channel(1);
    let (results, results_rx) = mpsc::channel(1);

    let mut control = ControlLoop::new(LoopParts {
        workspace,
        loader,
        engine: Arc::new(ScriptedEngine),
        registry,
        runner: None,
        transport: outbox.clone(),
        log: Arc::new(NullLog),
        events: EventEmitter::to_writer(events.clone()),
        heartbeat_target: Some("owner".into()),
        max_tool_rounds: 4,
    });
    let inputs = LoopInputs {
        inbound: inbound_rx,
        file_changes: change_rx,
        heartbeat: heartbeat.map(tokio::time::interval),
        worker_results: results_rx,
    };
    let loop_ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let outcome = control.run(&loop_ctx, inputs).await;
        (control, outcome)
    });

    Harness {
        ctx,
        inbound,
        changes,
        results,
        outbox,
        events,
        handle,
    }
}

#[tokio::test]
async fn tool_executions_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let check = Arc::new(ReentrancyCheck::default());
    let harness = start(
        dir.path(),
        SwitchLoader::new(dir.path(), Some("v1")),
        Some(check.clone()),
        Some(Duration::from_millis(3)),
    );

    let inbound = harness.inbound.clone();
    let changes = harness.changes.clone();
    let producer = tokio::spawn(async move {
        for i in 0..10 {
            inbound
                .send(InboundMessage::new(format!("chat-{i}"), "owner", "hi"))
                .await
                .unwrap();
            let _ = changes.try_send(());
        }
    });

    producer.await.unwrap();
    let sent = harness.outbox.wait_for(10).await;
    harness.ctx.cancel();
    let (_, outcome) = harness.handle.await.unwrap();

    outcome.unwrap();
    assert_eq!(check.overlaps.load(Ordering::SeqCst), 0);
    assert!(check.calls.load(Ordering::SeqCst) >= 10);
    assert!(sent.iter().all(|(_, text)| text == "v1"));
    // Per-channel FIFO: replies come back in send order.
    let chats: Vec<String> = sent.into_iter().map(|(chat, _)| chat).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("chat-{i}")).collect();
    assert_eq!(chats, expected);
}

#[tokio::test]
async fn failed_reload_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let loader = SwitchLoader::new(dir.path(), Some("v1"));
    let harness = start(dir.path(), loader.clone(), None, None);

    loader.set(None);
    harness.changes.send(()).await.unwrap();
    while loader.loads.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "what now"))
        .await
        .unwrap();
    assert_eq!(harness.outbox.wait_for(1).await[0].1, "v1");

    loader.set(Some("v2"));
    harness.changes.send(()).await.unwrap();
    while loader.loads.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "and now"))
        .await
        .unwrap();
    assert_eq!(harness.outbox.wait_for(2).await[1].1, "v2");

    harness.ctx.cancel();
    let (control, outcome) = harness.handle.await.unwrap();
    outcome.unwrap();
    assert_eq!(control.workspace().get("AGENTS.md"), Some("v2"));
}

#[tokio::test]
async fn transient_failures_keep_the_loop_running() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        SwitchLoader::new(dir.path(), Some("v1")),
        None,
        Some(Duration::from_millis(5)),
    );

    // Let several failing heartbeats go by.
    tokio::time::sleep(Duration::from_millis(40)).await;
    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "fail"))
        .await
        .unwrap();
    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "hello"))
        .await
        .unwrap();

    let sent = harness.outbox.wait_for(2).await;
    assert!(sent[0].1.contains("rate limited"));
    assert_eq!(sent[1].1, "v1");
    // Failed heartbeats never reach the heartbeat target.
    assert!(sent.iter().all(|(chat, _)| chat == "chat"));

    harness.ctx.cancel();
    let (_, outcome) = harness.handle.await.unwrap();
    outcome.unwrap();
}

#[tokio::test]
async fn fatal_engine_error_ends_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        SwitchLoader::new(dir.path(), Some("v1")),
        None,
        None,
    );

    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "die"))
        .await
        .unwrap();
    let (_, outcome) = tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .unwrap()
        .unwrap();
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("credentials revoked"));
    assert!(!harness.ctx.is_cancelled());
}

#[tokio::test]
async fn worker_completion_is_delivered_to_its_chat() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        SwitchLoader::new(dir.path(), Some("v1")),
        None,
        None,
    );

    harness
        .results
        .send(WorkerResult {
            task_id: TaskId::from("worker-1"),
            success: true,
            output: Some("summary of findings".into()),
            error: None,
            outcome: WorkerOutcome::Completed,
            reply_to: Some("chat-42".into()),
            elapsed: Duration::from_secs(3),
        })
        .await
        .unwrap();
    harness
        .results
        .send(WorkerResult {
            task_id: TaskId::from("worker-2"),
            success: false,
            output: None,
            error: Some("worker timed out after 100ms".into()),
            outcome: WorkerOutcome::TimedOut,
            reply_to: None,
            elapsed: Duration::from_millis(100),
        })
        .await
        .unwrap();

    let sent = harness.outbox.wait_for(1).await;
    assert_eq!(sent[0].0, "chat-42");
    assert!(sent[0].1.contains("worker-1"));
    assert!(sent[0].1.contains("summary of findings"));

    for _ in 0..500 {
        if harness.events.of_type("worker_completed").len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.ctx.cancel();
    let (_, outcome) = harness.handle.await.unwrap();
    outcome.unwrap();
    // The result without a reply target is logged only.
    assert_eq!(harness.outbox.sent().len(), 1);

    let completions = harness.events.of_type("worker_completed");
    assert_eq!(completions.len(), 2);
    assert_eq!(completions[0]["task_id"], "worker-1");
    assert_eq!(completions[0]["outcome"], "completed");
    assert_eq!(completions[1]["outcome"], "timed_out");
    assert_eq!(completions[1]["elapsed_ms"], 100);
}

#[tokio::test]
async fn cancellation_abandons_a_stalled_turn() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        dir.path(),
        SwitchLoader::new(dir.path(), Some("v1")),
        None,
        None,
    );

    harness
        .inbound
        .send(InboundMessage::new("chat", "owner", "stall"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.ctx.cancel();

    let (_, outcome) = tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .expect("loop returns promptly after cancellation")
        .unwrap();
    outcome.unwrap();
    assert!(harness.outbox.sent().is_empty());
}
