use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use burrow::{
    agent::CommandEngine,
    config::{Cli, Commands, RunCommand, Settings, WorkerCommand},
    context::RuntimeContext,
    error::StartupError,
    events::init_logging,
    memory::HourlyLog,
    runner::ProcessLauncher,
    runtime::{run_main, run_worker, Collaborators},
    secrets::{resolve_passphrase, FileVault, SecretSnapshot},
    source::StdinTransport,
    workspace::DirWorkspaceLoader,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = match &cli.command {
        Commands::Run(cmd) => &cmd.common,
        Commands::Worker(cmd) => &cmd.common,
    };
    init_logging(&common.log_level)?;

    match cli.command {
        Commands::Run(cmd) => run(cmd).await,
        Commands::Worker(cmd) => worker(cmd).await,
    }
}

async fn run(cmd: RunCommand) -> Result<()> {
    let mut settings = Settings::from_common(&cmd.common)?;
    if let Some(workspace) = cmd.workspace {
        settings.config.workspace = workspace;
    }
    let workspace = settings.config.workspace.clone();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed creating workspace {}", workspace.display()))?;

    // Prompt before installing signal handlers so ctrl-c still aborts it.
    let passphrase = resolve_passphrase(true)?;
    let ctx = RuntimeContext::from_signals()?;
    let collaborators = collaborators(&settings, &workspace, passphrase)?;

    let report = run_main(&settings, collaborators, ctx).await?;
    tracing::info!(
        target = "burrow::main",
        clean = report.clean,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "stopped"
    );
    Ok(())
}

async fn worker(cmd: WorkerCommand) -> Result<()> {
    let settings = Settings::from_common(&cmd.common)?;
    let passphrase = resolve_passphrase(false)?;
    let ctx = RuntimeContext::from_signals()?;
    let collaborators = collaborators(&settings, &cmd.workspace, passphrase)?;

    run_worker(
        &settings,
        collaborators,
        ctx,
        Duration::from_secs(cmd.timeout_secs.max(1)),
    )
    .await
}

fn collaborators(
    settings: &Settings,
    workspace: &Path,
    passphrase: String,
) -> Result<Collaborators, StartupError> {
    let vault = FileVault::unlock(&settings.vault_path, &passphrase)?;
    let secrets = SecretSnapshot::capture(&vault).map_err(|e| StartupError::VaultUnlock {
        path: settings.vault_path.clone(),
        reason: format!("{e:#}"),
    })?;

    let engine_line = settings
        .config
        .engine_command
        .as_deref()
        .ok_or_else(|| StartupError::Collaborator {
            name: "decision engine",
            reason: "engine_command is not set in the config file".to_string(),
        })?;
    let engine = CommandEngine::from_command_line(engine_line, &secrets)?;

    Ok(Collaborators {
        secrets,
        loader: Arc::new(DirWorkspaceLoader::new(workspace)),
        transport: Arc::new(StdinTransport::new()),
        engine: Arc::new(engine),
        log: Arc::new(HourlyLog::in_workspace(workspace)),
        launcher: Arc::new(ProcessLauncher::new(Some(passphrase))),
    })
}
