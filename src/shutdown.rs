//! Bounded drain after the root context is cancelled.
//!
//! The drain runs under its own deadline context, unrelated to the root
//! one: operational work is cancelled instantly, the drain itself is never
//! allowed to run past [`SHUTDOWN_DEADLINE`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::task::TaskTracker;

use crate::{
    config::SHUTDOWN_DEADLINE,
    context::{RuntimeContext, RuntimePhase},
    memory::LogStore,
    runner::WorkerRunner,
};

/// Text of the audit entry written once per drain.
pub const SHUTDOWN_AUDIT: &str = "shutdown initiated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every step finished inside the deadline.
    pub clean: bool,
    pub audit_written: bool,
    pub worker_drained: bool,
    pub producers_drained: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

pub struct ShutdownSequencer {
    root: RuntimeContext,
    log: Arc<dyn LogStore>,
    runner: Option<WorkerRunner>,
    producers: TaskTracker,
    deadline: Duration,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownSequencer {
    pub fn new(
        root: RuntimeContext,
        log: Arc<dyn LogStore>,
        runner: Option<WorkerRunner>,
        producers: TaskTracker,
    ) -> Self {
        Self {
            root,
            log,
            runner,
            producers,
            deadline: SHUTDOWN_DEADLINE,
            report: OnceCell::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs the drain once; later calls return the first report.
    pub async fn drain(&self) -> ShutdownReport {
        *self.report.get_or_init(|| self.run_steps()).await
    }

    async fn run_steps(&self) -> ShutdownReport {
        let started = Instant::now();
        self.root.advance(RuntimePhase::ShuttingDown);
        self.root.cancel();

        let bounded = RuntimeContext::with_deadline(self.deadline);
        tracing::info!(
            target = "burrow::shutdown",
            deadline_ms = self.deadline.as_millis() as u64,
            worker_active = self.runner.as_ref().is_some_and(WorkerRunner::is_active),
            "draining"
        );

        let audit_written = self.write_audit(&bounded).await;
        let worker_drained = self.drain_worker(&bounded).await;
        let producers_drained = self.drain_producers(&bounded).await;

        let report = ShutdownReport {
            clean: audit_written && worker_drained && producers_drained,
            audit_written,
            worker_drained,
            producers_drained,
            elapsed: started.elapsed(),
        };
        self.root.advance(RuntimePhase::Stopped);

        if report.clean {
            tracing::info!(target = "burrow::shutdown", elapsed_ms = report.elapsed.as_millis() as u64, "clean stop");
        } else {
            tracing::warn!(
                target = "burrow::shutdown",
                elapsed_ms = report.elapsed.as_millis() as u64,
                audit_written,
                worker_drained,
                producers_drained,
                "forced stop"
            );
        }
        report
    }

    async fn write_audit(&self, bounded: &RuntimeContext) -> bool {
        let log = self.log.clone();
        let write = tokio::task::spawn_blocking(move || log.append("audit", SHUTDOWN_AUDIT));
        tokio::select! {
            joined = write => match joined {
                Ok(Ok(())) => true,
                Ok(Err(error)) => {
                    tracing::warn!(target = "burrow::shutdown", error = %error, "failed writing shutdown audit entry");
                    false
                }
                Err(error) => {
                    tracing::warn!(target = "burrow::shutdown", error = %error, "shutdown audit task failed");
                    false
                }
            },
            _ = bounded.done() => {
                tracing::warn!(target = "burrow::shutdown", "deadline passed while writing shutdown audit entry");
                false
            }
        }
    }

    async fn drain_worker(&self, bounded: &RuntimeContext) -> bool {
        let Some(runner) = self.runner.as_ref().filter(|r| r.is_active()) else {
            return true;
        };
        match runner.wait_for_completion(bounded).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(target = "burrow::shutdown", task_id = %error.task_id, "worker still running at deadline, leaving it to the OS");
                false
            }
        }
    }

    async fn drain_producers(&self, bounded: &RuntimeContext) -> bool {
        self.producers.close();
        tokio::select! {
            _ = self.producers.wait() => true,
            _ = bounded.done() => {
                tracing::warn!(
                    target = "burrow::shutdown",
                    pending = self.producers.len(),
                    "producers still running at deadline"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use tokio_util::task::TaskTracker;

    use super::{ShutdownSequencer, SHUTDOWN_AUDIT};
    use crate::{
        context::{RuntimeContext, RuntimePhase},
        memory::LogStore,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl LogStore for Recorder {
        fn append(&self, kind: &str, text: &str) -> anyhow::Result<()> {
            self.0.lock().push(format!("{kind}:{text}"));
            Ok(())
        }
    }

    struct Broken;

    impl LogStore for Broken {
        fn append(&self, _kind: &str, _text: &str) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn idle_drain_is_clean_and_idempotent() {
        let root = RuntimeContext::new();
        let log = Arc::new(Recorder::default());
        let producers = TaskTracker::new();
        let token = root.token();
        producers.spawn(async move { token.cancelled().await });

        let sequencer = ShutdownSequencer::new(root.clone(), log.clone(), None, producers);
        let first = sequencer.drain().await;
        let second = sequencer.drain().await;

        assert!(first.clean);
        assert_eq!(first, second);
        assert!(root.is_cancelled());
        assert_eq!(root.phase(), RuntimePhase::Stopped);
        assert_eq!(*log.0.lock(), vec![format!("audit:{SHUTDOWN_AUDIT}")]);
    }

    #[tokio::test]
    async fn failed_audit_is_not_fatal() {
        let root = RuntimeContext::new();
        let sequencer = ShutdownSequencer::new(root, Arc::new(Broken), None, TaskTracker::new());
        let report = sequencer.drain().await;
        assert!(!report.clean);
        assert!(!report.audit_written);
        assert!(report.producers_drained);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_producer_is_abandoned_at_deadline() {
        let root = RuntimeContext::new();
        let producers = TaskTracker::new();
        producers.spawn(std::future::pending::<()>());

        let sequencer =
            ShutdownSequencer::new(root, Arc::new(Recorder::default()), None, producers);
        let started = tokio::time::Instant::now();
        let report = sequencer.drain().await;

        assert!(!report.producers_drained);
        assert!(!report.clean);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
    }
}
