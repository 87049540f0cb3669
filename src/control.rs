//! The control loop: the single consumer of every producer channel.
//!
//! Each iteration takes exactly one event and handles it to completion,
//! including every tool call the decision engine asks for, before the next
//! `select!`. Cancellation is the one exception: it abandons a turn in
//! progress. Nothing else touches the workspace snapshot.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::{sync::mpsc, time::Interval};

use crate::{
    agent::{run_turn, DecisionEngine, Trigger, TurnOutput},
    context::RuntimeContext,
    error::EngineError,
    events::{EventEmitter, RuntimeEvent},
    memory::LogStore,
    runner::WorkerRunner,
    source::MessageTransport,
    tools::{ToolContext, ToolRegistry},
    types::{EventEnvelope, InboundMessage, WorkerResult},
    workspace::{WorkspaceLoader, WorkspaceSnapshot},
};

/// Heartbeat replies equal to this are not forwarded.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Receiving ends of every producer.
pub struct LoopInputs {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub file_changes: mpsc::Receiver<()>,
    /// `None` disables heartbeats.
    pub heartbeat: Option<Interval>,
    pub worker_results: mpsc::Receiver<WorkerResult>,
}

pub struct LoopParts {
    pub workspace: WorkspaceSnapshot,
    pub loader: Arc<dyn WorkspaceLoader>,
    pub engine: Arc<dyn DecisionEngine>,
    pub registry: ToolRegistry,
    pub runner: Option<WorkerRunner>,
    pub transport: Arc<dyn MessageTransport>,
    pub log: Arc<dyn LogStore>,
    pub events: EventEmitter,
    pub heartbeat_target: Option<String>,
    pub max_tool_rounds: u32,
}

pub struct ControlLoop {
    workspace: WorkspaceSnapshot,
    loader: Arc<dyn WorkspaceLoader>,
    engine: Arc<dyn DecisionEngine>,
    registry: ToolRegistry,
    runner: Option<WorkerRunner>,
    transport: Arc<dyn MessageTransport>,
    log: Arc<dyn LogStore>,
    events: EventEmitter,
    heartbeat_target: Option<String>,
    max_tool_rounds: u32,
}

struct OpenInputs {
    inbound: bool,
    file_changes: bool,
    worker_results: bool,
}

impl ControlLoop {
    pub fn new(parts: LoopParts) -> Self {
        Self {
            workspace: parts.workspace,
            loader: parts.loader,
            engine: parts.engine,
            registry: parts.registry,
            runner: parts.runner,
            transport: parts.transport,
            log: parts.log,
            events: parts.events,
            heartbeat_target: parts.heartbeat_target,
            max_tool_rounds: parts.max_tool_rounds,
        }
    }

    pub fn workspace(&self) -> &WorkspaceSnapshot {
        &self.workspace
    }

    /// Runs until `ctx` is cancelled (`Ok`) or the decision engine reports
    /// a non-retryable failure (`Err`).
    pub async fn run(&mut self, ctx: &RuntimeContext, mut inputs: LoopInputs) -> Result<()> {
        let mut open = OpenInputs {
            inbound: true,
            file_changes: true,
            worker_results: true,
        };
        tracing::info!(
            target = "burrow::control",
            tools = ?self.registry.names(),
            heartbeat = inputs.heartbeat.is_some(),
            "control loop started"
        );

        loop {
            let event = next_event(ctx, &mut inputs, &mut open).await;
            tracing::trace!(target = "burrow::control", kind = event.kind(), "event");
            // Turns can block on the engine for minutes; shutdown must not
            // wait for them. Dropping the turn drops the engine call with it.
            let handled = match event {
                EventEnvelope::InboundMessage(msg) => tokio::select! {
                    handled = self.handle_inbound(msg) => Some(handled),
                    _ = ctx.done() => None,
                },
                EventEnvelope::HeartbeatTick => tokio::select! {
                    _ = self.handle_heartbeat() => Some(Ok(())),
                    _ = ctx.done() => None,
                },
                EventEnvelope::FileChangeSignal => {
                    self.reload("file change").await;
                    Some(Ok(()))
                }
                EventEnvelope::WorkerCompletion(result) => {
                    self.handle_completion(result).await;
                    Some(Ok(()))
                }
                EventEnvelope::ShutdownRequested => break,
            };
            match handled {
                Some(handled) => handled?,
                None => {
                    tracing::warn!(target = "burrow::control", "turn abandoned, shutting down");
                    break;
                }
            }
        }

        tracing::info!(target = "burrow::control", "control loop stopped");
        Ok(())
    }

    async fn handle_inbound(&mut self, msg: InboundMessage) -> Result<()> {
        tracing::info!(target = "burrow::control", chat_id = %msg.chat_id, sender = %msg.sender, id = %msg.id, "inbound message");
        self.record("inbound", &format!("{}: {}", msg.sender, msg.text));
        self.events.emit(&RuntimeEvent::InboundMessage {
            id: &msg.id,
            chat_id: &msg.chat_id,
            sender: &msg.sender,
        });

        let trigger = Trigger::Message {
            chat_id: msg.chat_id.clone(),
            sender: msg.sender.clone(),
            text: msg.text.clone(),
        };
        let tool_ctx = ToolContext {
            reply_to: Some(msg.chat_id.clone()),
        };

        match self.turn(&trigger, &tool_ctx).await {
            Ok(turn) => {
                if let Some(reply) = turn.reply {
                    self.record("reply", &reply);
                    self.deliver(&msg.chat_id, &reply).await;
                }
                Ok(())
            }
            Err(EngineError::Fatal(reason)) => {
                tracing::error!(target = "burrow::control", reason = %reason, "decision engine failed permanently");
                Err(anyhow!("decision engine failed: {reason}"))
            }
            Err(EngineError::Transient(reason)) => {
                tracing::warn!(target = "burrow::control", chat_id = %msg.chat_id, reason = %reason, "message handling failed");
                self.deliver(
                    &msg.chat_id,
                    &format!("Sorry, I could not handle that message ({reason})."),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn handle_heartbeat(&mut self) {
        tracing::debug!(target = "burrow::control", "heartbeat");
        let tool_ctx = ToolContext {
            reply_to: self.heartbeat_target.clone(),
        };

        match self.turn(&Trigger::Heartbeat, &tool_ctx).await {
            Ok(turn) => {
                let Some(reply) = turn.reply.filter(|r| r.trim() != HEARTBEAT_OK) else {
                    return;
                };
                self.record("heartbeat", &reply);
                if let Some(target) = self.heartbeat_target.clone() {
                    self.deliver(&target, &reply).await;
                }
            }
            Err(error) => {
                tracing::warn!(target = "burrow::control", error = %error, "heartbeat failed");
            }
        }
    }

    async fn handle_completion(&mut self, result: WorkerResult) {
        let summary = result.summary();
        tracing::info!(
            target = "burrow::control",
            task_id = %result.task_id,
            success = result.success,
            outcome = ?result.outcome,
            "worker completion"
        );
        self.record("worker", &format!("{}: {}", result.task_id, summary));
        self.events.emit(&RuntimeEvent::WorkerCompleted {
            task_id: &result.task_id,
            success: result.success,
            outcome: result.outcome,
            elapsed_ms: result.elapsed.as_millis() as u64,
        });

        if let Some(chat_id) = &result.reply_to {
            let text = if result.success {
                format!("Worker {} finished:\n{}", result.task_id, summary)
            } else {
                format!("Worker {}: {}", result.task_id, summary)
            };
            self.deliver(chat_id, &text).await;
        }

        if let Some(runner) = &self.runner {
            runner.release(&result.task_id);
        }
    }

    async fn turn(
        &mut self,
        trigger: &Trigger,
        tool_ctx: &ToolContext,
    ) -> Result<TurnOutput, EngineError> {
        let turn = run_turn(
            self.engine.as_ref(),
            &self.registry,
            &self.workspace,
            trigger,
            tool_ctx,
            self.max_tool_rounds,
        )
        .await?;
        if turn.reload_requested {
            self.reload("tool request").await;
        }
        Ok(turn)
    }

    /// Replaces the snapshot, or keeps the current one if loading fails.
    async fn reload(&mut self, reason: &str) {
        let loader = self.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(anyhow::Error::from)
            .and_then(|loaded| loaded);
        match loaded {
            Ok(snapshot) => {
                tracing::info!(target = "burrow::control", reason, files = snapshot.files.len(), "workspace reloaded");
                self.workspace = snapshot;
            }
            Err(error) => {
                tracing::warn!(target = "burrow::control", reason, error = %format!("{error:#}"), "workspace reload failed, keeping previous snapshot");
            }
        }
    }

    async fn deliver(&self, chat_id: &str, text: &str) {
        if let Err(error) = self.transport.send(chat_id, text).await {
            tracing::warn!(target = "burrow::control", chat_id, error = %error, "failed sending reply");
        }
    }

    fn record(&self, kind: &str, text: &str) {
        if let Err(error) = self.log.append(kind, text) {
            tracing::warn!(target = "burrow::control", kind, error = %error, "failed writing memory log");
        }
    }
}

async fn next_event(
    ctx: &RuntimeContext,
    inputs: &mut LoopInputs,
    open: &mut OpenInputs,
) -> EventEnvelope {
    loop {
        if ctx.is_cancelled() {
            return EventEnvelope::ShutdownRequested;
        }
        tokio::select! {
            _ = ctx.done() => return EventEnvelope::ShutdownRequested,
            msg = inputs.inbound.recv(), if open.inbound => match msg {
                Some(msg) => return EventEnvelope::InboundMessage(msg),
                None => {
                    tracing::debug!(target = "burrow::control", "message source closed");
                    open.inbound = false;
                }
            },
            change = inputs.file_changes.recv(), if open.file_changes => match change {
                Some(()) => return EventEnvelope::FileChangeSignal,
                None => {
                    tracing::debug!(target = "burrow::control", "change watcher closed");
                    open.file_changes = false;
                }
            },
            result = inputs.worker_results.recv(), if open.worker_results => match result {
                Some(result) => return EventEnvelope::WorkerCompletion(result),
                None => open.worker_results = false,
            },
            _ = next_tick(&mut inputs.heartbeat) => return EventEnvelope::HeartbeatTick,
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
