//! Wiring for the two run modes.
//!
//! Every external collaborator arrives through [`Collaborators`]; nothing
//! here reaches for globals, so tests can run either mode with stubs.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::task::TaskTracker;

use crate::{
    agent::{run_turn, DecisionEngine, Trigger},
    config::Settings,
    context::RuntimeContext,
    control::{ControlLoop, LoopInputs, LoopParts},
    error::StartupError,
    events::{EventEmitter, RuntimeEvent},
    memory::LogStore,
    runner::{WorkerLauncher, WorkerRunner},
    secrets::SecretSnapshot,
    shutdown::{ShutdownReport, ShutdownSequencer},
    source::{run_message_source, MessageTransport, SourceOptions},
    tools::{RegistryKind, SpawnCapability, ToolContext, ToolRegistry, WorkerDefaults},
    types::{RESULT_FILE, TASK_FILE},
    watcher::run_change_watcher,
    workspace::{WorkspaceLoader, WorkspaceSnapshot},
};

pub struct Collaborators {
    pub secrets: SecretSnapshot,
    pub loader: Arc<dyn WorkspaceLoader>,
    pub transport: Arc<dyn MessageTransport>,
    pub engine: Arc<dyn DecisionEngine>,
    pub log: Arc<dyn LogStore>,
    pub launcher: Arc<dyn WorkerLauncher>,
}

fn load_workspace(loader: &dyn WorkspaceLoader) -> Result<WorkspaceSnapshot, StartupError> {
    loader.load().map_err(|source| StartupError::WorkspaceLoad {
        path: loader.root().to_path_buf(),
        source,
    })
}

/// Main mode: producers, heartbeat, delegation, then a bounded drain once
/// `ctx` is cancelled. Startup failures return before any task is spawned.
pub async fn run_main(
    settings: &Settings,
    collaborators: Collaborators,
    ctx: RuntimeContext,
) -> Result<ShutdownReport> {
    let cfg = &settings.config;
    let events = EventEmitter::new(settings.json_events);
    let Collaborators {
        secrets,
        loader,
        transport,
        engine,
        log,
        launcher,
    } = collaborators;

    let workspace = load_workspace(loader.as_ref())?;
    let binary = std::env::current_exe().map_err(|e| StartupError::Collaborator {
        name: "worker binary",
        reason: e.to_string(),
    })?;
    tracing::info!(
        target = "burrow::runtime",
        workspace = %workspace.root().display(),
        definition_files = workspace.files.len(),
        secrets = secrets.len(),
        "runtime starting"
    );

    let producers = TaskTracker::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let (change_tx, change_rx) = mpsc::channel(1);
    producers.spawn(run_message_source(
        transport.clone(),
        SourceOptions {
            allow_list: cfg.allow_list.clone(),
            poll_interval: cfg.poll_interval(),
        },
        inbound_tx,
        ctx.token(),
    ));
    producers.spawn(run_change_watcher(
        loader.root().to_path_buf(),
        cfg.watch_interval(),
        change_tx,
        ctx.token(),
    ));

    let heartbeat = cfg.heartbeat_interval().map(|period| {
        let now = Instant::now();
        let mut ticker = interval_at(now.checked_add(period).unwrap_or(now), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    let (runner, worker_results) = WorkerRunner::new(&ctx, launcher);
    let defaults = WorkerDefaults {
        binary,
        config_path: settings.config_path.clone(),
        vault_path: Some(settings.vault_path.clone()),
        timeout: cfg.worker_timeout(),
    };
    let registry = ToolRegistry::build(
        workspace.root(),
        RegistryKind::Full(SpawnCapability::new(runner.clone(), defaults)),
    );

    events.emit(&RuntimeEvent::RuntimeStarted {
        workspace: workspace.root(),
        tools: registry.names(),
    });

    let mut control = ControlLoop::new(LoopParts {
        workspace,
        loader,
        engine,
        registry,
        runner: Some(runner.clone()),
        transport,
        log: log.clone(),
        events: events.clone(),
        heartbeat_target: cfg.heartbeat_target.clone(),
        max_tool_rounds: cfg.max_tool_rounds,
    });
    let outcome = control
        .run(
            &ctx,
            LoopInputs {
                inbound: inbound_rx,
                file_changes: change_rx,
                heartbeat,
                worker_results,
            },
        )
        .await;

    // An unrecoverable loop error still drains before it is surfaced.
    let sequencer = ShutdownSequencer::new(ctx, log, Some(runner), producers);
    let report = sequencer.drain().await;
    events.emit(&RuntimeEvent::RuntimeStopped(report));

    outcome?;
    Ok(report)
}

/// Delegated-worker mode: one turn on `task.md` with a restricted registry,
/// bounded by `timeout` and `ctx`. Writes the reply to `result.md`.
pub async fn run_worker(
    settings: &Settings,
    collaborators: Collaborators,
    ctx: RuntimeContext,
    timeout: Duration,
) -> Result<()> {
    let Collaborators {
        loader,
        engine,
        log,
        ..
    } = collaborators;
    let root = loader.root().to_path_buf();

    let task_path = root.join(TASK_FILE);
    let task = tokio::fs::read_to_string(&task_path)
        .await
        .map_err(|e| StartupError::WorkspaceLoad {
            path: task_path.clone(),
            source: e.into(),
        })?;
    let workspace = load_workspace(loader.as_ref())?;
    let registry = ToolRegistry::build(&root, RegistryKind::Restricted);
    tracing::info!(
        target = "burrow::runtime",
        workspace = %root.display(),
        timeout_ms = timeout.as_millis() as u64,
        "worker starting"
    );
    record(log.as_ref(), "task", task.trim());

    let trigger = Trigger::Task {
        task: task.trim().to_string(),
    };
    let tool_ctx = ToolContext::default();
    let turn = tokio::select! {
        turn = run_turn(
            engine.as_ref(),
            &registry,
            &workspace,
            &trigger,
            &tool_ctx,
            settings.config.max_tool_rounds,
        ) => turn.map_err(|e| anyhow!("worker turn failed: {e}"))?,
        _ = tokio::time::sleep(timeout) => bail!("worker timed out after {timeout:?}"),
        _ = ctx.done() => bail!("worker cancelled"),
    };

    if let Some(reply) = turn.reply.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        write_result(&root, reply).await?;
        record(log.as_ref(), "result", reply);
    }
    tracing::info!(
        target = "burrow::runtime",
        rounds = turn.rounds,
        tool_calls = turn.exchanges.len(),
        "worker finished"
    );
    Ok(())
}

async fn write_result(root: &Path, text: &str) -> Result<()> {
    let path = root.join(RESULT_FILE);
    let tmp = root.join(format!("{RESULT_FILE}.tmp"));
    tokio::fs::write(&tmp, text)
        .await
        .with_context(|| format!("failed writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

fn record(log: &dyn LogStore, kind: &str, text: &str) {
    if let Err(error) = log.append(kind, text) {
        tracing::warn!(target = "burrow::runtime", kind, error = %error, "failed writing memory log");
    }
}
