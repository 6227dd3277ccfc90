//! CLI binary for driving and auditing Corvus runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use corvus_ledger::{LedgerAnchor, RunLedger};
use corvus_pipeline::{CorvusConfig, Orchestrator, PrerequisiteGraph, StageMachine, TransitionInputs};
use corvus_types::{CorvusError, LedgerEntry, StageState};

#[derive(Parser)]
#[command(name = "corvus", version, about = "Ledger-backed stage pipeline for build and compliance runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a corvus.toml (default: ./corvus.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ledger database path, overriding the config
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run and record intake
    Start {
        /// Run identifier (default: cf-<date>-<time>-<hex>)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Move one stage to a new state
    Transition {
        run_id: String,
        stage_id: String,
        #[arg(value_parser = parse_state)]
        state: StageState,

        #[arg(long, default_value = "")]
        input_hash: String,

        #[arg(long, default_value = "")]
        output_hash: String,

        /// Content address of a produced artifact (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,

        /// Waiver reference (repeatable)
        #[arg(long = "waiver")]
        waivers: Vec<String>,
    },

    /// Run a stage through running -> passed with a JSON payload
    Execute {
        run_id: String,
        stage_id: String,

        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Waive a blocked stage
    Waive {
        run_id: String,
        stage_id: String,

        #[arg(long = "waiver", required = true)]
        waivers: Vec<String>,
    },

    /// Show every stage's state in a run
    Status {
        run_id: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List a run's ledger entries
    History {
        run_id: String,

        /// Only entries for this stage
        #[arg(long)]
        stage: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Verify a run's hash chain
    Verify { run_id: String },

    /// Export or check a run anchor
    Anchor {
        #[command(subcommand)]
        command: AnchorCommands,
    },

    /// List known runs, most recently active first
    Runs,

    /// Show the configured stage table in execution order
    Stages,
}

#[derive(Subcommand)]
enum AnchorCommands {
    /// Write the run's current anchor as JSON
    Export {
        run_id: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the ledger against a saved anchor
    Verify { run_id: String, file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(failure_status(&err))
        }
    }
}

/// 2 for ledger integrity failures, 1 for everything else.
fn failure_status(err: &anyhow::Error) -> u8 {
    let integrity = err
        .downcast_ref::<CorvusError>()
        .is_some_and(CorvusError::is_integrity_failure);
    if integrity {
        tracing::error!(error = %err, "Ledger integrity check failed");
        2
    } else {
        tracing::debug!(error = %err, "Command failed");
        1
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = CorvusConfig::load(cli.config.as_deref())?;
    if let Some(ledger) = cli.ledger {
        config.ledger_path = ledger;
    }
    init_tracing(&config, cli.verbose);

    let graph = Arc::new(PrerequisiteGraph::new(config.stage_definitions())?);
    tracing::debug!(ledger = %config.ledger_path.display(), stages = graph.len(), "Opening ledger");
    let ledger = Arc::new(RunLedger::open_with(&config.ledger_path, config.max_connections).await?);
    let machine = Arc::new(
        StageMachine::new(Arc::clone(&ledger), graph)
            .with_versions(config.versions.clone())
            .with_strict_version_pins(config.strict_version_pins),
    );
    let orchestrator = Orchestrator::new(Arc::clone(&machine), config.trust_context.clone());

    let result = match cli.command {
        Commands::Start { run_id } => cmd_start(&orchestrator, run_id).await,
        Commands::Transition {
            run_id,
            stage_id,
            state,
            input_hash,
            output_hash,
            artifacts,
            waivers,
        } => {
            let inputs = TransitionInputs {
                input_hash,
                output_hash,
                artifact_references: artifacts,
                waiver_references: waivers,
                trust_context: config.trust_context.clone(),
            };
            let entry = machine.transition(&run_id, &stage_id, state, inputs).await?;
            print_entry_line(&entry);
            Ok(())
        }
        Commands::Execute { run_id, stage_id, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            orchestrator.resume_run(&run_id).await?;
            let output = orchestrator.execute_stage(&run_id, &stage_id, payload).await?;
            println!("{stage_id} passed");
            println!("{}", serde_json::to_string_pretty(&output.result)?);
            Ok(())
        }
        Commands::Waive { run_id, stage_id, waivers } => {
            let entry = orchestrator.waive_stage(&run_id, &stage_id, waivers).await?;
            print_entry_line(&entry);
            Ok(())
        }
        Commands::Status { run_id, json } => cmd_status(&machine, &run_id, json).await,
        Commands::History { run_id, stage, json } => cmd_history(&ledger, &run_id, stage.as_deref(), json).await,
        Commands::Verify { run_id } => {
            let count = ledger.entry_count(&run_id).await?;
            machine.verify_chain(&run_id).await?;
            println!("Chain intact: {run_id} ({count} entries)");
            Ok(())
        }
        Commands::Anchor { command } => cmd_anchor(&ledger, command).await,
        Commands::Runs => {
            for run_id in ledger.get_all_run_ids().await? {
                let count = ledger.entry_count(&run_id).await?;
                println!("{run_id}  {count} entries");
            }
            Ok(())
        }
        Commands::Stages => cmd_stages(machine.graph()),
    };

    ledger.close().await;
    result
}

/// `RUST_LOG` wins; otherwise `--verbose` means debug, else the configured level.
fn init_tracing(config: &CorvusConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_state(raw: &str) -> Result<StageState, String> {
    raw.parse()
}

/// `cf-<YYYYmmdd>-<HHMMSS>-<3 hex>`.
fn generate_run_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("cf-{stamp}-{}", &suffix[..3])
}

async fn cmd_start(orchestrator: &Orchestrator, run_id: Option<String>) -> anyhow::Result<()> {
    let run_id = run_id.unwrap_or_else(generate_run_id);
    let states = orchestrator.start_run(&run_id, Vec::new()).await?;
    println!("Started run: {run_id}");
    println!("Stages: {}", states.len());
    let ready = orchestrator.next_ready_stages(&run_id).await?;
    if !ready.is_empty() {
        println!("Ready: {}", ready.join(", "));
    }
    Ok(())
}

fn cmd_stages(graph: &PrerequisiteGraph) -> anyhow::Result<()> {
    for stage_id in graph.stage_ids() {
        let Some(def) = graph.definition(stage_id) else {
            continue;
        };
        let gate = if def.is_mandatory_gate { " [gate]" } else { "" };
        println!("  {:<20} {}{}", def.stage_id, def.display_name, gate);
        if !def.prerequisites.is_empty() {
            println!("  {:<20} after: {}", "", def.prerequisites.join(", "));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StageStatus<'a> {
    stage_id: &'a str,
    display_name: &'a str,
    state: StageState,
    blocked_by: Vec<String>,
}

async fn cmd_status(machine: &StageMachine, run_id: &str, json: bool) -> anyhow::Result<()> {
    let states = machine.get_all_states(run_id).await?;
    let mut rows = Vec::new();
    for stage_id in machine.graph().stage_ids() {
        let (ready, reasons) = machine.can_start(run_id, stage_id).await?;
        let state = states.get(stage_id).copied().unwrap_or(StageState::NotStarted);
        rows.push(StageStatus {
            stage_id,
            display_name: machine
                .graph()
                .definition(stage_id)
                .map(|d| d.display_name.as_str())
                .unwrap_or(stage_id),
            state,
            blocked_by: if ready || state != StageState::NotStarted {
                Vec::new()
            } else {
                reasons
            },
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Run: {run_id}");
    for row in &rows {
        println!("  {:<20} {:<12} {}", row.stage_id, row.state, row.display_name);
        for reason in &row.blocked_by {
            println!("  {:<20} waiting on {reason}", "");
        }
    }
    Ok(())
}

async fn cmd_history(ledger: &RunLedger, run_id: &str, stage: Option<&str>, json: bool) -> anyhow::Result<()> {
    let entries = match stage {
        Some(stage_id) => ledger.get_stage_history(run_id, stage_id).await?,
        None => ledger.get_run_entries(run_id).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No entries for {run_id}");
    }
    for entry in &entries {
        print_entry_line(entry);
        if !entry.waiver_references.is_empty() {
            println!("    waivers: {}", entry.waiver_references.join(", "));
        }
        if !entry.artifact_references.is_empty() {
            println!("    artifacts: {}", entry.artifact_references.join(", "));
        }
    }
    Ok(())
}

async fn cmd_anchor(ledger: &RunLedger, command: AnchorCommands) -> anyhow::Result<()> {
    match command {
        AnchorCommands::Export { run_id, output } => {
            let anchor = ledger.export_anchor(&run_id).await?;
            match output {
                Some(path) => {
                    anchor.write_to(&path).await?;
                    println!("Anchor written: {} ({} entries)", path.display(), anchor.entry_count);
                }
                None => println!("{}", serde_json::to_string_pretty(&anchor)?),
            }
        }
        AnchorCommands::Verify { run_id, file } => {
            let anchor = LedgerAnchor::read_from(&file).await?;
            ledger.verify_against_anchor(&run_id, &anchor).await?;
            println!("Anchor holds: {run_id} ({} anchored entries)", anchor.entry_count);
        }
    }
    Ok(())
}

fn print_entry_line(entry: &LedgerEntry) {
    println!(
        "{}  {:<20} {:<24} {}",
        corvus_types::timestamp_serde::format(&entry.timestamp_utc),
        entry.stage_id,
        entry.state_transition,
        short_hash(&entry.entry_hash),
    );
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
