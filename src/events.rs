use std::{
    fmt,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use crate::{
    shutdown::ShutdownReport,
    types::{TaskId, WorkerOutcome},
};

/// `level` wins when it parses; otherwise `RUST_LOG`, then `info`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Lifecycle milestones a supervisor can follow without parsing logs.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RuntimeEvent<'a> {
    RuntimeStarted {
        workspace: &'a Path,
        tools: Vec<&'a str>,
    },
    InboundMessage {
        id: &'a str,
        chat_id: &'a str,
        sender: &'a str,
    },
    WorkerCompleted {
        task_id: &'a TaskId,
        success: bool,
        outcome: WorkerOutcome,
        elapsed_ms: u64,
    },
    RuntimeStopped(ShutdownReport),
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a RuntimeEvent<'a>,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes one JSON object per [`RuntimeEvent`], or nothing when disabled.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Option<Sink>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl EventEmitter {
    /// Events go to stderr when `json_output` is set.
    pub fn new(json_output: bool) -> Self {
        if json_output {
            Self::to_writer(io::stderr())
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: &RuntimeEvent<'_>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = match serde_json::to_string(&EventLine {
            ts: Utc::now().to_rfc3339(),
            event,
        }) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(target = "burrow::events", error = %error, "failed encoding event");
                return;
            }
        };

        let mut sink = sink.lock();
        if let Err(error) = writeln!(sink, "{line}").and_then(|()| sink.flush()) {
            tracing::debug!(target = "burrow::events", error = %error, "failed writing event");
        }
    }
}
