// packages/engine/src/main.rs
//! Conductor Coordination Engine
//!
//! Loads configuration, starts the background loops and either runs one
//! workflow file to quiescence or serves until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use conductor_engine::executor::WorkflowDefinition;
use conductor_engine::observability::{init_metrics, init_tracing};
use conductor_engine::runtime::{AgentRuntime, ProcessRuntime, ScriptedRuntime};
use conductor_engine::utils::config::EngineConfig;
use conductor_engine::Orchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Conductor engine command line
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about)]
struct Args {
    /// Configuration file (defaults to config/engine.*)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workflow definition (YAML or JSON) to run to quiescence, then exit
    #[arg(short, long)]
    workflow: Option<PathBuf>,

    /// Use the in-memory scripted runtime instead of worker processes
    #[arg(long)]
    dry_run: bool,

    /// Start instances up to each scaling policy's minimum before serving
    #[arg(long)]
    prewarm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::load().context("loading configuration")?,
    };

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting Conductor engine v{}", conductor_engine::VERSION);

    let runtime: Arc<dyn AgentRuntime> = if args.dry_run {
        info!("Dry run: using the scripted runtime");
        Arc::new(ScriptedRuntime::new())
    } else {
        Arc::new(ProcessRuntime::new(&config.runtime))
    };

    let orchestrator = Arc::new(Orchestrator::new(config, runtime)?);
    let cancel = CancellationToken::new();
    let loops = orchestrator.start_background(cancel.clone());

    if args.prewarm {
        let created = orchestrator.prewarm().await?;
        info!("Pre-warmed {} agent instances", created.len());
    }

    let result = match &args.workflow {
        Some(path) => run_file(&orchestrator, path).await,
        None => {
            info!("Engine running, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("installing Ctrl+C handler")?;
            info!("Received shutdown signal, cleaning up...");
            Ok(())
        }
    };

    cancel.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            error!("Background loop panicked: {}", e);
        }
    }
    orchestrator.shutdown().await;

    result
}

async fn run_file(orchestrator: &Orchestrator, path: &Path) -> Result<()> {
    let definition = WorkflowDefinition::load(path)
        .with_context(|| format!("loading workflow from {}", path.display()))?;

    let workflow = orchestrator.submit_definition(definition).await?;
    info!("Running workflow {} '{}'", workflow.id, workflow.name);

    let finished = orchestrator.run_workflow(workflow.id).await?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(())
}
