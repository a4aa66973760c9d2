use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lieflow_core::config::AppConfig;
use lieflow_core::types::{Attrs, NodeId, WorkflowEvent};
use lieflow_workflow::{CommandRunner, RunnerRegistry, Workflow, WorkflowSpec};

#[derive(Parser)]
#[command(name = "lieflow", version, about = "Graph based workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "lieflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow document without running it
    Validate {
        /// Workflow JSON document
        workflow: PathBuf,
    },
    /// Print the status of every task
    Summary {
        workflow: PathBuf,
    },
    /// Run a workflow until it completes, fails or halts at a breakpoint
    Run {
        workflow: PathBuf,
        /// Workflow input as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Where to write the resulting state (default: in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Run `configuration.command` strings through `sh -c`
        #[arg(long)]
        shell: bool,
    },
    /// Clear the breakpoint on a task
    Step {
        workflow: PathBuf,
        nid: NodeId,
    },
    /// Reset a failed or aborted task to ready
    Retry {
        workflow: PathBuf,
        nid: NodeId,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Validate { workflow } => {
            let spec = WorkflowSpec::load_file(&workflow)?;
            spec.validate()?;
            println!("{}: {} tasks, valid", workflow.display(), spec.len());
        }
        Commands::Summary { workflow } => {
            let wf = Workflow::load_file(&workflow, RunnerRegistry::new())?;
            print!("{}", wf.summary());
        }
        Commands::Run {
            workflow,
            input,
            output,
            shell,
        } => {
            let mut registry = RunnerRegistry::new();
            let runner = if shell {
                CommandRunner::new().with_shell()
            } else {
                CommandRunner::new()
            };
            registry.set_fallback(runner);

            let wf = Workflow::load_file(&workflow, registry)?.with_config(&config);
            if let Some(raw) = input {
                let values: Attrs =
                    serde_json::from_str(&raw).context("--input must be a JSON object")?;
                wf.input(values)?;
            }

            let mut events = wf.subscribe();
            let reporter = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        WorkflowEvent::BreakpointReached { nid, task } => {
                            println!("breakpoint at task {} ({})", nid, task)
                        }
                        WorkflowEvent::RunFinished { .. } => break,
                        _ => {}
                    }
                }
            });

            wf.run_to_end().await?;
            if let Err(e) = reporter.await {
                warn!(error = %e, "Event reporter stopped");
            }

            print!("{}", wf.summary());
            let target = output.unwrap_or(workflow);
            wf.save_to(&target)?;

            if wf.is_completed() {
                println!("{}", serde_json::to_string_pretty(&wf.output(None)?)?);
            } else if let Some(nid) = wf.failed_task() {
                anyhow::bail!("workflow failed at task {}", nid);
            }
        }
        Commands::Step { workflow, nid } => {
            edit(&workflow, |wf| wf.step_breakpoint(nid).map_err(Into::into))?;
        }
        Commands::Retry { workflow, nid } => {
            edit(&workflow, |wf| wf.retry(nid).map_err(Into::into))?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Load a workflow, apply one change and write it back.
fn edit(path: &Path, change: impl FnOnce(&Workflow) -> anyhow::Result<()>) -> anyhow::Result<()> {
    let wf = Workflow::load_file(path, RunnerRegistry::new())
        .with_context(|| format!("loading {}", path.display()))?;
    change(&wf)?;
    wf.save_to(path)?;
    info!(path = %path.display(), "Workflow updated");
    Ok(())
}
