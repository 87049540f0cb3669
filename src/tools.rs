//! Tool registry and built-in tools.
//!
//! A registry is built either `Full` (main agent: file tools, delegation,
//! workspace reload) or `Restricted` (delegated worker: file tools only).
//! The delegation tool can only be constructed from a [`SpawnCapability`],
//! which only the `Full` variant carries.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ToolError,
    guard::{guard, PathGuard},
    runner::WorkerRunner,
    types::{TaskId, WorkerTask, TASK_FILE},
};

/// Largest file the read tool returns in full.
const MAX_READ_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Chat the current turn answers; delegated results are delivered there.
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip)]
    pub reload_workspace: bool,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            reload_workspace: false,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            reload_workspace: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn call(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError>;
}

/// What a worker launched from this registry inherits.
#[derive(Debug, Clone)]
pub struct WorkerDefaults {
    pub binary: PathBuf,
    pub config_path: Option<PathBuf>,
    pub vault_path: Option<PathBuf>,
    pub timeout: Duration,
}

/// Permission to delegate work. Holding one is the only way to build the
/// `spawn_worker` tool.
#[derive(Clone)]
pub struct SpawnCapability {
    runner: WorkerRunner,
    defaults: WorkerDefaults,
}

impl SpawnCapability {
    pub fn new(runner: WorkerRunner, defaults: WorkerDefaults) -> Self {
        Self { runner, defaults }
    }
}

pub enum RegistryKind {
    Full(SpawnCapability),
    Restricted,
}

pub struct ToolRegistry {
    root: PathBuf,
    restricted: bool,
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn build(root: &Path, kind: RegistryKind) -> Self {
        let root = PathGuard::new(root).root().to_path_buf();
        let mut registry = Self {
            root: root.clone(),
            restricted: matches!(kind, RegistryKind::Restricted),
            handlers: BTreeMap::new(),
        };

        registry.register_guarded(Arc::new(ReadFileTool { root: root.clone() }));
        registry.register_guarded(Arc::new(WriteFileTool {
            root: root.clone(),
            append: false,
        }));
        registry.register_guarded(Arc::new(WriteFileTool {
            root: root.clone(),
            append: true,
        }));
        registry.register_guarded(Arc::new(ListDirTool { root: root.clone() }));

        if let RegistryKind::Full(capability) = kind {
            registry.register(Arc::new(SpawnWorkerTool {
                root: root.clone(),
                capability,
            }));
            registry.register(Arc::new(ReloadWorkspaceTool));
        }

        registry
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Registers `handler` behind this registry's path guard.
    pub fn register_guarded(&mut self, handler: Arc<dyn ToolHandler>) {
        self.register(guard(&self.root, handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn describe(&self) -> Vec<ToolSpec> {
        self.handlers
            .values()
            .map(|h| ToolSpec {
                name: h.name().to_string(),
                description: h.description().to_string(),
            })
            .collect()
    }

    /// Runs one tool call. Never fails: errors come back as failed outcomes
    /// so the decision engine can see them.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let Some(handler) = self.handlers.get(&call.name) else {
            let error = ToolError::UnknownTool(call.name.clone());
            tracing::warn!(target = "burrow::tools", tool = %call.name, "unknown tool requested");
            return ToolOutcome::failure(error.to_string());
        };

        match handler.call(ctx, &call.args).await {
            Ok(outcome) => {
                tracing::debug!(target = "burrow::tools", tool = %call.name, success = outcome.success, "tool executed");
                outcome
            }
            Err(error) => {
                tracing::warn!(
                    target = "burrow::tools",
                    tool = %call.name,
                    kind = error.kind(),
                    error = %error,
                    "tool call failed"
                );
                ToolOutcome::failure(error.to_string())
            }
        }
    }
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing string field '{field}'")))
}

struct ReadFileTool {
    root: PathBuf,
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Args: path."
    }

    async fn call(&self, _ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError> {
        let raw = required_str(args, "path")?;
        let path = self.root.join(raw);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::io(format!("failed reading {raw}"), e))?;
        if content.len() > MAX_READ_BYTES {
            let mut end = MAX_READ_BYTES;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            return Ok(ToolOutcome::success(format!(
                "{}\n[truncated at {} bytes of {}]",
                &content[..end],
                end,
                content.len()
            )));
        }
        Ok(ToolOutcome::success(content))
    }
}

struct WriteFileTool {
    root: PathBuf,
    append: bool,
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn name(&self) -> &str {
        if self.append {
            "append_file"
        } else {
            "write_file"
        }
    }

    fn description(&self) -> &str {
        if self.append {
            "Append text to a file, creating it if needed. Args: path, content."
        } else {
            "Create or replace a text file. Args: path, content."
        }
    }

    async fn call(&self, _ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError> {
        use tokio::io::AsyncWriteExt;

        let raw = required_str(args, "path")?;
        let content = required_str(args, "content")?;
        let path = self.root.join(raw);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(format!("failed creating parent of {raw}"), e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&path)
            .await
            .map_err(|e| ToolError::io(format!("failed opening {raw}"), e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ToolError::io(format!("failed writing {raw}"), e))?;
        file.flush()
            .await
            .map_err(|e| ToolError::io(format!("failed flushing {raw}"), e))?;

        Ok(ToolOutcome::success(format!(
            "wrote {} bytes to {raw}",
            content.len()
        )))
    }
}

struct ListDirTool {
    root: PathBuf,
}

#[async_trait]
impl ToolHandler for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory. Args: path (optional, defaults to the workspace root)."
    }

    async fn call(&self, _ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError> {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = self.root.join(raw);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::io(format!("failed listing {raw}"), e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ToolError::io(format!("failed listing {raw}"), e))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(ToolOutcome::success(names.join("\n")))
    }
}

struct SpawnWorkerTool {
    root: PathBuf,
    capability: SpawnCapability,
}

#[async_trait]
impl ToolHandler for SpawnWorkerTool {
    fn name(&self) -> &str {
        "spawn_worker"
    }

    fn description(&self) -> &str {
        "Delegate a task to an isolated background worker. One worker at a time; \
         the result is delivered when it finishes. Args: task, timeout_secs (optional)."
    }

    async fn call(&self, ctx: &ToolContext, args: &Value) -> Result<ToolOutcome, ToolError> {
        let task_text = required_str(args, "task")?;
        let runner = &self.capability.runner;
        if let Some(active) = runner.active_task() {
            return Err(ToolError::AdmissionRejected { active });
        }

        let defaults = &self.capability.defaults;
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        let id = TaskId::generate();
        let workspace = self.root.join("workers").join(id.as_str());
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| ToolError::io("failed creating worker workspace", e))?;
        tokio::fs::write(workspace.join(TASK_FILE), task_text)
            .await
            .map_err(|e| ToolError::io("failed writing worker task", e))?;

        let mut task = WorkerTask::new(id.clone(), workspace.clone(), defaults.binary.clone())
            .with_timeout(timeout)
            .with_reply_to(ctx.reply_to.clone());
        task.config_path = defaults.config_path.clone();
        task.vault_path = defaults.vault_path.clone();
        let timeout = task.timeout;

        if let Err(error) = runner.spawn(task) {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&workspace).await {
                tracing::debug!(target = "burrow::tools", task_id = %id, error = %cleanup, "failed removing unused worker workspace");
            }
            return Err(error);
        }

        Ok(ToolOutcome::success(format!(
            "started worker {id} (timeout {}s); its result will be delivered when it finishes",
            timeout.as_secs()
        )))
    }
}

struct ReloadWorkspaceTool;

#[async_trait]
impl ToolHandler for ReloadWorkspaceTool {
    fn name(&self) -> &str {
        "reload_workspace"
    }

    fn description(&self) -> &str {
        "Reload the agent definition files after editing them."
    }

    async fn call(&self, _ctx: &ToolContext, _args: &Value) -> Result<ToolOutcome, ToolError> {
        Ok(ToolOutcome {
            success: true,
            output: "workspace reload scheduled after this turn".to_string(),
            reload_workspace: true,
        })
    }
}
