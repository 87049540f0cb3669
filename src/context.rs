//! Process-wide cancellation and lifecycle phase.
//!
//! A [`RuntimeContext`] is the single cancellation source threaded through
//! every producer task, the control loop, and the sub-worker runner. The
//! shutdown sequencer builds a second, independent context with a fixed
//! deadline so the drain can never hang.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RuntimePhase {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl RuntimePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    phase: Arc<AtomicU8>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            phase: Arc::new(AtomicU8::new(RuntimePhase::Running as u8)),
        }
    }

    /// Fresh context, unrelated to any other, that is done once `timeout`
    /// has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::new()
        }
    }

    /// Root context cancelled by SIGINT or SIGTERM.
    pub fn from_signals() -> std::io::Result<Self> {
        let ctx = Self::new();
        let token = ctx.token.clone();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!(target = "burrow::context", "received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!(target = "burrow::context", "received SIGTERM, shutting down");
                    }
                    _ = token.cancelled() => return,
                }
                token.cancel();
            });
        }

        #[cfg(not(unix))]
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(target = "burrow::context", "received ctrl-c, shutting down");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        Ok(ctx)
    }

    /// Derived context: cancelled with its parent, cancellable on its own,
    /// sharing the parent's phase.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            phase: self.phase.clone(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn phase(&self) -> RuntimePhase {
        RuntimePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Moves the phase forward. Returns `false` when `next` is not ahead of
    /// the current phase; the phase never moves backward.
    pub fn advance(&self, next: RuntimePhase) -> bool {
        let prev = self.phase.fetch_max(next as u8, Ordering::AcqRel);
        prev < next as u8
    }
}
