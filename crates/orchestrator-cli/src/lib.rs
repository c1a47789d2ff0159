//! Library entry point for the `orchestrator-cli` binary. Exists mainly so
//! embedders can drive the exact CLI surface (`orchestrator_cli::run()`)
//! without shelling out to the binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_agent::ScriptedAgentExecutor;
use orchestrator_config::{load_config, ConfigOverrides};
use orchestrator_core::{Orchestrator, OrchestratorError};
use orchestrator_progress::default_reporter;
use orchestrator_types::{Pipeline, PipelineId, Schedule, ScheduleId};

#[derive(Parser, Debug)]
#[command(name = "orchestrator", version = version())]
#[command(about = "DAG pipeline engine and cron/event schedule dispatcher")]
struct Cli {
    /// Directory holding state, locks, the audit log, and an optional
    /// `.orchestrator.toml`.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pipeline definitions.
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCommands,
    },
    /// Submitted runs.
    Run {
        #[command(subcommand)]
        cmd: RunCommands,
    },
    /// Cron/interval/one-shot/event schedules.
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCommands,
    },
    /// Run crash recovery, then the dispatcher's primary-election/tick
    /// loop, in the foreground until interrupted.
    Serve,
    /// Print the durable audit trail as newline-delimited JSON.
    Audit,
}

#[derive(Subcommand, Debug)]
enum PipelineCommands {
    /// Validate and persist a pipeline definition from a JSON file.
    Register { file: PathBuf },
    /// Print the latest version of a registered pipeline.
    Show { pipeline_id: String },
    /// Submit a run for the latest version of a pipeline.
    Submit {
        pipeline_id: String,
        /// JSON input for the run's trigger node. Defaults to `null`.
        #[arg(long)]
        input: Option<String>,
        /// Dedup key: resubmitting the same key returns the original run_id
        /// instead of starting a second run.
        #[arg(long)]
        idempotency_key: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RunCommands {
    /// Print a run's current status snapshot.
    Status { run_id: String },
    /// Request cancellation of an in-flight run.
    Cancel { run_id: String },
    /// Block until a run reaches a terminal status or `--timeout` elapses.
    Await {
        run_id: String,
        #[arg(long, default_value = "5m")]
        timeout: String,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// Persist a new schedule from a JSON file.
    Register { file: PathBuf },
    /// List every registered schedule.
    List,
    Enable { schedule_id: String },
    Disable { schedule_id: String },
}

fn version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("ORCH_GIT_SHA"),
        ", ",
        env!("ORCH_BUILD_PROFILE"),
        ", rustc ",
        env!("ORCH_RUSTC_VERSION"),
        ")"
    )
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Parse argv, wire the orchestration core, and dispatch to the matching
/// subcommand. The binary's `main` is a one-line forward to this.
pub fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let config = load_config(&cli.state_dir, ConfigOverrides::default())
        .with_context(|| format!("loading config from {}", cli.state_dir.display()))?;
    let orchestrator = Orchestrator::new(&config, Arc::new(ScriptedAgentExecutor::new()))
        .context("wiring the orchestration core")?;

    match cli.cmd {
        Commands::Pipeline { cmd } => run_pipeline(&orchestrator, cmd).await,
        Commands::Run { cmd } => run_run(&orchestrator, cmd).await,
        Commands::Schedule { cmd } => run_schedule(&orchestrator, cmd).await,
        Commands::Serve => run_serve(&orchestrator).await,
        Commands::Audit => run_audit(&orchestrator),
    }
}

async fn run_pipeline(orchestrator: &Orchestrator, cmd: PipelineCommands) -> Result<()> {
    match cmd {
        PipelineCommands::Register { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let pipeline: Pipeline =
                serde_json::from_str(&text).with_context(|| format!("parsing pipeline from {}", file.display()))?;
            let id = pipeline.id;
            let version = pipeline.version;
            orchestrator.register_pipeline(&pipeline)?;
            println!("registered pipeline {id} v{version}");
            Ok(())
        }
        PipelineCommands::Show { pipeline_id } => {
            let id = parse_pipeline_id(&pipeline_id)?;
            let pipeline = orchestrator.latest_pipeline(id)?;
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            Ok(())
        }
        PipelineCommands::Submit { pipeline_id, input, idempotency_key } => {
            let id = parse_pipeline_id(&pipeline_id)?;
            let input = match input {
                Some(raw) => serde_json::from_str(&raw).context("parsing --input as JSON")?,
                None => serde_json::Value::Null,
            };
            let reporter = default_reporter();
            let run_id = match orchestrator.submit_pipeline(id, input, idempotency_key).await {
                Ok(run_id) => run_id,
                Err(OrchestratorError::Engine(orchestrator_engine::EngineError::Conflict(run_id))) => {
                    println!("duplicate idempotency key, returning original run_id: {run_id}");
                    run_id
                }
                Err(e) => return Err(e.into()),
            };
            reporter.run_started(&run_id.to_string(), &pipeline_id);
            println!("run_id: {run_id}");
            Ok(())
        }
    }
}

async fn run_run(orchestrator: &Orchestrator, cmd: RunCommands) -> Result<()> {
    match cmd {
        RunCommands::Status { run_id } => {
            let id = run_id.parse().map_err(|_| anyhow::anyhow!("invalid run id {run_id:?}"))?;
            let snapshot = orchestrator.run_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        RunCommands::Cancel { run_id } => {
            let id = run_id.parse().map_err(|_| anyhow::anyhow!("invalid run id {run_id:?}"))?;
            let cancelled = orchestrator.cancel_run(id).await?;
            println!("cancelled: {cancelled}");
            Ok(())
        }
        RunCommands::Await { run_id, timeout } => {
            let id = run_id.parse().map_err(|_| anyhow::anyhow!("invalid run id {run_id:?}"))?;
            let timeout = humantime::parse_duration(&timeout).with_context(|| format!("invalid duration {timeout:?}"))?;
            let snapshot = orchestrator.await_run(id, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

async fn run_schedule(orchestrator: &Orchestrator, cmd: ScheduleCommands) -> Result<()> {
    match cmd {
        ScheduleCommands::Register { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let schedule: Schedule =
                serde_json::from_str(&text).with_context(|| format!("parsing schedule from {}", file.display()))?;
            let id = schedule.id;
            orchestrator.register_schedule(&schedule)?;
            println!("registered schedule {id}");
            Ok(())
        }
        ScheduleCommands::List => {
            let schedules = orchestrator.list_schedules()?;
            println!("{}", serde_json::to_string_pretty(&schedules)?);
            Ok(())
        }
        ScheduleCommands::Enable { schedule_id } => {
            let id = parse_schedule_id(&schedule_id)?;
            orchestrator.set_schedule_enabled(id, true)?;
            println!("enabled schedule {id}");
            Ok(())
        }
        ScheduleCommands::Disable { schedule_id } => {
            let id = parse_schedule_id(&schedule_id)?;
            orchestrator.set_schedule_enabled(id, false)?;
            println!("disabled schedule {id}");
            Ok(())
        }
    }
}

async fn run_serve(orchestrator: &Orchestrator) -> Result<()> {
    let reporter = default_reporter();
    reporter.message("recovering stale runs and schedule claims...");
    orchestrator.recover().await?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_cancel.cancel();
    });

    reporter.message("entering dispatcher loop (ctrl-c to stop)...");
    orchestrator.run(cancel).await?;
    reporter.message("dispatcher loop stopped");
    Ok(())
}

fn run_audit(orchestrator: &Orchestrator) -> Result<()> {
    let log = orchestrator.read_audit_log()?;
    for record in log.all() {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn parse_pipeline_id(raw: &str) -> Result<PipelineId> {
    raw.parse().map_err(|_| anyhow::anyhow!("invalid pipeline id {raw:?}"))
}

fn parse_schedule_id(raw: &str) -> Result<ScheduleId> {
    raw.parse().map_err(|_| anyhow::anyhow!("invalid schedule id {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_pipeline_id_rejects_garbage() {
        assert!(parse_pipeline_id("not-a-uuid").is_err());
    }

    #[test]
    fn parse_schedule_id_rejects_garbage() {
        assert!(parse_schedule_id("not-a-uuid").is_err());
    }

    #[test]
    fn help_lists_every_top_level_subcommand() {
        let cmd = Cli::command();
        let names: Vec<_> = cmd.get_subcommands().map(|s| s.get_name().to_string()).collect();
        for expected in ["pipeline", "run", "schedule", "serve", "audit"] {
            assert!(names.contains(&expected.to_string()), "missing subcommand {expected}");
        }
    }
}
