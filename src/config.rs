use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Hard upper bound on the shutdown drain.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Time between SIGTERM and SIGKILL when stopping a worker.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
pub const PASSPHRASE_ENV: &str = "BURROW_VAULT_PASSPHRASE";
/// Longer heartbeat periods are clamped to this.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(name = "burrow")]
#[command(about = "Personal automation runtime with a delegated sub-worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the main agent: message source, watcher, heartbeat and delegation.
    Run(RunCommand),
    /// Internal: run one delegated task inside an isolated workspace.
    /// Launched by the sub-worker runner, not for direct use.
    #[command(hide = true)]
    Worker(WorkerCommand),
}

#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    #[arg(long, env = "BURROW_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "BURROW_VAULT")]
    pub vault: Option<PathBuf>,

    #[arg(long, env = "BURROW_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit JSON-lines lifecycle events on stderr.
    #[arg(long, default_value_t = false)]
    pub json_events: bool,
}

#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Overrides `workspace` from the config file.
    #[arg(long)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerCommand {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long)]
    pub workspace: PathBuf,

    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,
}

/// On-disk runtime configuration. Every field has a default so a partial
/// (or absent) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Decision engine command line, split with shell quoting rules.
    #[serde(default)]
    pub engine_command: Option<String>,
    /// Senders allowed to talk to the agent. Empty allows everyone.
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub heartbeat_target: Option<String>,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

fn default_workspace() -> PathBuf {
    state_dir().join("workspace")
}
fn default_heartbeat_secs() -> u64 {
    30 * 60
}
fn default_watch_interval_ms() -> u64 {
    2_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_worker_timeout_secs() -> u64 {
    DEFAULT_WORKER_TIMEOUT.as_secs()
}
fn default_max_tool_rounds() -> u32 {
    8
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine_command: None,
            allow_list: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            heartbeat_target: None,
            watch_interval_ms: default_watch_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_timeout_secs: default_worker_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl RuntimeConfig {
    /// Missing file yields defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(target = "burrow::config", path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| {
            Duration::from_secs(self.heartbeat_interval_secs).min(MAX_HEARTBEAT_INTERVAL)
        })
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(100))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

/// Resolved settings shared by both run modes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: RuntimeConfig,
    /// Forwarded to delegated workers.
    pub config_path: Option<PathBuf>,
    pub vault_path: PathBuf,
    pub json_events: bool,
}

impl Settings {
    pub fn from_common(common: &CommonArgs) -> Result<Self> {
        let config_path = common
            .config
            .clone()
            .unwrap_or_else(|| state_dir().join("config.json"));
        let config = RuntimeConfig::load(&config_path)?;
        Ok(Self {
            config,
            config_path: Some(config_path),
            vault_path: common
                .vault
                .clone()
                .unwrap_or_else(|| state_dir().join("vault.json")),
            json_events: common.json_events,
        })
    }
}

/// `~/.burrow`, or `./.burrow` when there is no home directory.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".burrow")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{Cli, Commands, RuntimeConfig, DEFAULT_WORKER_TIMEOUT, MAX_HEARTBEAT_INTERVAL};

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.worker_timeout(), DEFAULT_WORKER_TIMEOUT);
        assert_eq!(cfg.max_tool_rounds, 8);
        assert_eq!(cfg.heartbeat_interval(), Some(Duration::from_secs(1800)));
        assert!(cfg.allow_list.is_empty());
    }

    #[test]
    fn zero_heartbeat_disables_ticker() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{"heartbeat_interval_secs": 0}"#).unwrap();
        assert!(cfg.heartbeat_interval().is_none());
    }

    #[test]
    fn huge_heartbeat_is_clamped() {
        let cfg: RuntimeConfig =
            serde_json::from_str(&format!(r#"{{"heartbeat_interval_secs": {}}}"#, u64::MAX))
                .unwrap();
        let period = cfg.heartbeat_interval().unwrap();
        assert_eq!(period, MAX_HEARTBEAT_INTERVAL);
        assert!(tokio::time::Instant::now().checked_add(period).is_some());
    }

    #[test]
    fn missing_file_is_default_and_bad_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = RuntimeConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(missing.poll_interval_ms, 500);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(RuntimeConfig::load(&bad).is_err());
    }

    #[test]
    fn worker_subcommand_parses() {
        let cli = Cli::parse_from([
            "burrow",
            "worker",
            "--workspace",
            "/tmp/ws",
            "--timeout-secs",
            "12",
            "--vault",
            "/tmp/vault.json",
        ]);
        match cli.command {
            Commands::Worker(cmd) => {
                assert_eq!(cmd.timeout_secs, 12);
                assert_eq!(cmd.workspace.to_str(), Some("/tmp/ws"));
                assert_eq!(
                    cmd.common.vault.as_deref().and_then(|p| p.to_str()),
                    Some("/tmp/vault.json")
                );
            }
            other => panic!("expected worker command, got {other:?}"),
        }
    }
}
