//! groupflow CLI - run group plans against a node-graph server.

mod config;
mod workspace;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::CliConfig;
use groupflow_client::HttpBackend;
use groupflow_core::{ExecutionPlan, RunId, RunRequest, RunStatus, StateAction};
use groupflow_execution::{ExecutionEngine, ExecutionLock, GroupSelector};
use groupflow_state::StateManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use workspace::WorkspaceSnapshot;

#[derive(Parser)]
#[command(name = "groupflow")]
#[command(about = "Sequential group execution for node-graph workflows", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan
    Run {
        /// Plan file
        plan: PathBuf,
        /// Workspace snapshot file
        #[arg(long)]
        workspace: PathBuf,
        /// Server URL (overrides the config file)
        #[arg(long)]
        server: Option<String>,
        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Check a plan against a workspace without running it
    Validate {
        /// Plan file
        plan: PathBuf,
        /// Workspace snapshot file
        #[arg(long)]
        workspace: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            plan,
            workspace,
            server,
            run_id,
        } => {
            let config = config.with_server(server);
            let plan = load_plan(&plan)?;
            let workspace = WorkspaceSnapshot::load(&workspace)?;
            run(config, plan, workspace, run_id).await?;
        }
        Commands::Validate { plan, workspace } => {
            let plan = load_plan(&plan)?;
            let workspace = WorkspaceSnapshot::load(&workspace)?;
            validate(&plan, &workspace)?;
        }
    }

    Ok(())
}

fn load_plan(path: &Path) -> Result<ExecutionPlan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse plan {}", path.display()))
}

async fn run(
    config: CliConfig,
    plan: ExecutionPlan,
    workspace: WorkspaceSnapshot,
    run_id: Option<String>,
) -> Result<()> {
    let session_id = config
        .session_id
        .clone()
        .unwrap_or_else(|| format!("cli_{}", ulid::Ulid::new()));
    let run_id = run_id.map(RunId::from).unwrap_or_default();

    let backend = HttpBackend::new(&config.server_url)
        .with_timeout(Duration::from_secs(config.request_timeout_secs))
        .with_client_id(&session_id);
    let lock = Arc::new(ExecutionLock::new(config.lock));
    let watchdog = lock.spawn_watchdog();
    let states = Arc::new(StateManager::new(config.retention));

    let engine = Arc::new(
        ExecutionEngine::new(
            session_id.clone(),
            lock,
            Arc::clone(&states),
            Arc::new(workspace),
            Arc::new(backend),
        )
        .with_config(config.engine),
    );
    engine.initialize().await;

    let mut changes = states.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            if change.action != StateAction::Updated {
                continue;
            }
            let state = &change.snapshot.state;
            debug!(
                "Run {} {} {:.0}% (current group: {})",
                change.run_id,
                state.status,
                change.snapshot.progress,
                state.current_group.as_deref().unwrap_or("-")
            );
        }
    });

    info!("Running plan as {} against {}", run_id, config.server_url);
    let mut handle = engine.spawn_run(RunRequest::new(run_id, plan, session_id));

    let outcome = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, cancelling");
            engine.interrupt().await;
            handle.await
        }
    };

    watchdog.abort();
    progress.abort();

    let report = outcome.context("Run task panicked")??;
    println!("{}", report.message);
    for failure in &report.failed_groups {
        println!("  FAILED  {}: {}", failure.group_name, failure.message);
    }
    for group in &report.skipped_groups {
        println!("  SKIPPED {}", group);
    }

    match report.status {
        RunStatus::Completed if report.failed_groups.is_empty() => Ok(()),
        RunStatus::Completed => anyhow::bail!("{} group(s) failed", report.failed_groups.len()),
        status => anyhow::bail!("Run ended {}", status),
    }
}

fn validate(plan: &ExecutionPlan, workspace: &WorkspaceSnapshot) -> Result<()> {
    plan.validate()?;

    let selector = GroupSelector::new(workspace);
    let partition = selector.partition(plan);

    println!("Plan {} ({} groups)", plan.config_hash(), plan.total_groups());
    for (index, group) in plan.groups.iter().enumerate() {
        match partition.muted.iter().find(|m| m.index == index) {
            Some(muted) => println!("  SKIP {} ({})", group.group_name, muted.reason),
            None => {
                let outputs: Vec<String> = selector
                    .output_nodes(&group.group_name)
                    .iter()
                    .map(|id| id.to_string())
                    .collect();
                println!("  RUN  {} (outputs: {})", group.group_name, outputs.join(", "));
            }
        }
    }

    if partition.active.is_empty() && !plan.groups.is_empty() {
        warn!("No group in the plan would run");
    }
    Ok(())
}
