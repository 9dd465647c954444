//! # smithers-cli
//!
//! Binary entry point for the Smithers orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Configuration loading and validation
//! - YAML workflows rendered into node trees each frame
//! - Remote control of a running execution through slash commands on stdin
//! - Inspection of persisted executions via `smithers history` and `smithers status`

mod workflow;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use smithers_adapters::{CliExecutor, EchoExecutor, ShellToolRunner};
use smithers_core::{
    CommandError, ExecutionLoop, HumanStatus, LoopHandle, RunContext, RunResult, RunStatus,
    SmithersConfig, StateStore, TaskStatus, TerminationReason,
};
use smithers_proto::{Error, Executor, RenderContext};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use workflow::Workflow;

/// Output format for inspection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for programmatic access
    Json,
}

/// Smithers - frame-based orchestration for LLM workflows
#[derive(Parser, Debug)]
#[command(name = "smithers", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "smithers.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new execution of a workflow
    Run(RunArgs),

    /// Continue a persisted execution from its journal
    Resume(ResumeArgs),

    /// Show the transition history of a state key
    History(HistoryArgs),

    /// Show execution records and task counts
    Status(StatusArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Workflow file describing the node tree
    #[arg(short, long)]
    workflow: PathBuf,

    /// Execution id (generated when omitted)
    #[arg(long)]
    execution_id: Option<String>,

    /// Override the frame budget
    #[arg(long)]
    max_frames: Option<u32>,

    /// Echo prompts instead of running the executor command
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct ResumeArgs {
    /// Workflow file describing the node tree
    #[arg(short, long)]
    workflow: PathBuf,

    /// Execution id to resume
    #[arg(long)]
    execution_id: String,

    /// Override the frame budget
    #[arg(long)]
    max_frames: Option<u32>,

    /// Echo prompts instead of running the executor command
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct HistoryArgs {
    #[arg(long)]
    execution_id: String,

    /// State key to show
    #[arg(long)]
    key: String,

    /// Show only the last N transitions
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    #[arg(long)]
    execution_id: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Run(args) => run_command(&cli.config, args).await?,
        Commands::Resume(args) => resume_command(&cli.config, args).await?,
        Commands::History(args) => {
            history_command(&cli.config, args)?;
            0
        }
        Commands::Status(args) => {
            status_command(&cli.config, args)?;
            0
        }
    };

    // Use explicit exit for non-zero codes to ensure proper exit status
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

fn load_config(config_path: &Path) -> Result<SmithersConfig> {
    let config = if config_path.exists() {
        SmithersConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        debug!(path = %config_path.display(), "Config file not found, using defaults");
        SmithersConfig::default()
    };

    let warnings = config.validate().context("Configuration validation failed")?;
    for warning in &warnings {
        eprintln!("{warning}");
    }
    Ok(config)
}

async fn run_command(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(max_frames) = args.max_frames {
        config.loop_config.max_frames = Some(max_frames);
    }
    let workflow = Workflow::from_file(&args.workflow)?;

    if let Some(id) = &args.execution_id
        && config.store.persist
        && config.store.journal_path(id).exists()
    {
        bail!(
            "Execution '{id}' already exists. Use `smithers resume --execution-id {id}` to continue it."
        );
    }

    let ctx = RunContext::open(config, args.execution_id).context("Failed to open state store")?;
    execute_workflow(ctx, workflow, args.dry_run).await
}

async fn resume_command(config_path: &Path, args: ResumeArgs) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(max_frames) = args.max_frames {
        config.loop_config.max_frames = Some(max_frames);
    }

    let journal = config.store.journal_path(&args.execution_id);
    if !config.store.persist || !journal.exists() {
        bail!(
            "Cannot resume: no journal for execution '{}' at '{}'. Use `smithers run` to start a new execution.",
            args.execution_id,
            journal.display()
        );
    }
    info!(execution_id = %args.execution_id, journal = %journal.display(), "Resuming execution");

    let workflow = Workflow::from_file(&args.workflow)?;
    let ctx = RunContext::open(config, Some(args.execution_id))
        .context("Failed to replay execution journal")?;
    execute_workflow(ctx, workflow, args.dry_run).await
}

/// Drives the workflow to termination and returns the process exit code.
async fn execute_workflow(ctx: RunContext, workflow: Workflow, dry_run: bool) -> Result<i32> {
    let execution_id = ctx.execution_id.clone();
    let executor: Arc<dyn Executor> = if dry_run {
        Arc::new(EchoExecutor)
    } else {
        Arc::new(CliExecutor::new(workflow.executor.clone().unwrap_or_default()))
    };

    let workflow = Arc::new(workflow);
    let builder = move |rc: &RenderContext<'_>| workflow.render(rc);
    let exec_loop = ExecutionLoop::new(ctx, builder, executor)
        .with_tools(Arc::new(ShellToolRunner::new()));
    let handle = exec_loop.handle();

    info!(execution_id = %execution_id, dry_run, "Starting execution");
    let commands = tokio::spawn(forward_commands(handle.clone(), spawn_stdin_reader()));
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), aborting execution...");
            let _ = handle.abort("interrupted").await;
        }
    });

    let outcome = exec_loop.run().await;
    commands.abort();
    interrupt.abort();

    match outcome {
        Ok(result) => {
            print_summary(&result);
            Ok(result.reason.exit_code())
        }
        Err(Error::NodeExecution(err)) => {
            eprintln!("Execution {execution_id} failed: {err}");
            Ok(TerminationReason::NodeError.exit_code())
        }
        Err(e) => Err(e).context("Execution loop failed"),
    }
}

/// Reads stdin on a dedicated thread so a blocked read never holds up exit.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not read commands from stdin");
    }
    rx
}

async fn forward_commands(handle: LoopHandle, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle.execute_line(line).await {
            Ok(reply) => println!("{reply}"),
            Err(CommandError::LoopGone) => break,
            Err(e) => eprintln!("{e}"),
        }
    }
}

fn print_summary(result: &RunResult) {
    let icon = match result.status {
        RunStatus::Completed => "✓",
        RunStatus::MaxFramesReached => "⚠",
        RunStatus::Stopped => "■",
    };

    println!("\n+{}+", "-".repeat(58));
    println!(
        "| {icon} Execution {}: {} ({})",
        result.status.as_str(),
        result.execution_id,
        result.reason.as_str()
    );
    println!("+{}+", "-".repeat(58));
    println!("|   Frames:   {}", result.frames);
    println!("|   Elapsed:  {:.1}s", result.duration_ms as f64 / 1000.0);
    if let Some(message) = &result.message {
        println!("|   Reason:   {message}");
    }
    if let Some(output) = &result.output {
        println!("|   Output:   {}", truncate(output.trim(), 200));
    }
    println!("+{}+", "-".repeat(58));
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Loads an existing execution's store read-only.
fn open_existing(config: &SmithersConfig, execution_id: &str) -> Result<StateStore> {
    let journal = config.store.journal_path(execution_id);
    if !journal.exists() {
        bail!(
            "No journal for execution '{execution_id}' at '{}'",
            journal.display()
        );
    }
    StateStore::replay(&config.store.dir, execution_id)
        .with_context(|| format!("Failed to read journal {}", journal.display()))
}

fn history_command(config_path: &Path, args: HistoryArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_existing(&config, &args.execution_id)?;
    let history = store.history(&args.key, args.limit);

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history)?),
        OutputFormat::Table => {
            if history.is_empty() {
                println!("No transitions recorded for '{}'", args.key);
                return Ok(());
            }
            println!("{:<27} {:<28} VALUE", "TIMESTAMP", "WRITER");
            for t in &history {
                println!(
                    "{:<27} {:<28} {}",
                    t.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    truncate(&t.written_by, 28),
                    t.value
                );
            }
        }
    }
    Ok(())
}

fn status_command(config_path: &Path, args: StatusArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_existing(&config, &args.execution_id)?;
    let executions = store.executions();
    let phases = store.phases();
    let tasks = store.ledger().tasks();
    let running = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .count();
    let pending_humans: Vec<_> = store
        .human_requests()
        .into_iter()
        .filter(|h| h.status == HumanStatus::Pending)
        .collect();

    match args.format {
        OutputFormat::Json => {
            let status = serde_json::json!({
                "execution_id": args.execution_id,
                "executions": executions,
                "phases": phases,
                "tasks": { "running": running, "total": tasks.len() },
                "pending_approvals": pending_humans,
                "total_tokens": store.total_tokens(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Table => {
            println!("Execution: {}", args.execution_id);
            println!("Tasks: {running} running, {} total", tasks.len());
            println!("Tokens: {}", store.total_tokens());
            if !phases.is_empty() {
                println!("\nPhases:");
                for phase in &phases {
                    println!("  [{}] {:<10} {}", phase.index, phase.status.as_str(), phase.name);
                }
            }
            println!("\nNodes:");
            for record in &executions {
                println!(
                    "  {:<9} {} ({})",
                    record.status.as_str(),
                    record.path,
                    record.node_type
                );
            }
            for human in &pending_humans {
                println!("\nAwaiting approval: {} ({})", human.id, human.message);
            }
        }
    }
    Ok(())
}
