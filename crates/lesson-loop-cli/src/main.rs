use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lesson_loop_domain::ExecutionTrace;
use lesson_loop_evaluator::EvaluationRules;
use lesson_loop_memory::{JsonFileStore, PatternMemory, DEFAULT_THRESHOLD};
use lesson_loop_orchestrator::{LearningOrchestrator, RunReport};

mod demo;

#[derive(Debug, Parser)]
#[command(name = "lessons")]
#[command(about = "Procedural learning loop for tool-using agents")]
struct Cli {
    /// Path of the persisted lesson store.
    #[arg(long, default_value = "./lesson_loop.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate one completed trace, update memory, and report findings.
    Record(RecordArgs),
    /// List the active constraints in feed order.
    Constraints(JsonArgs),
    /// Show recent run history, most recent last.
    History(HistoryArgs),
    /// Show learning statistics.
    Stats(JsonArgs),
    /// Replay a scripted set of traces demonstrating the learning curve.
    Demo(DemoArgs),
}

#[derive(Debug, Args)]
struct RecordArgs {
    /// JSON file holding one execution trace.
    #[arg(long)]
    trace: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct DemoArgs {
    #[arg(long, default_value_t = demo::SCRIPT_LEN)]
    runs: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut orchestrator = open_orchestrator(&cli.store)?;

    match cli.command {
        Commands::Record(args) => record_command(&mut orchestrator, &args),
        Commands::Constraints(args) => constraints_command(&orchestrator, args.json),
        Commands::History(args) => history_command(&orchestrator, args.limit),
        Commands::Stats(args) => stats_command(&orchestrator, args.json),
        Commands::Demo(args) => demo::run(&mut orchestrator, args.runs),
    }
}

fn open_orchestrator(store: &Path) -> Result<LearningOrchestrator<JsonFileStore>> {
    let backend = JsonFileStore::new(store);
    let (memory, warning) = PatternMemory::open(backend, DEFAULT_THRESHOLD)
        .with_context(|| format!("failed to open lesson store at {}", store.display()))?;

    if let Some(message) = warning {
        eprintln!("warning: {message}; continuing with an empty store");
    }

    LearningOrchestrator::new(EvaluationRules::travel_planning(), memory)
        .context("invalid evaluation rules")
}

fn record_command(
    orchestrator: &mut LearningOrchestrator<JsonFileStore>,
    args: &RecordArgs,
) -> Result<()> {
    let body = fs::read_to_string(&args.trace)
        .with_context(|| format!("failed to read trace file {}", args.trace.display()))?;
    let trace: ExecutionTrace = serde_json::from_str(&body)
        .with_context(|| format!("invalid trace JSON in {}", args.trace.display()))?;

    let report = orchestrator.record_run(&trace)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "run_id={} success={} findings={} new_constraints={}",
        report.run_id,
        report.success,
        report.findings.len(),
        report.new_constraints.len()
    );
    for finding in &report.findings {
        match finding.step_index {
            Some(step) => println!("  [{}] step={} {}", finding.kind, step, finding.detail),
            None => println!("  [{}] {}", finding.kind, finding.detail),
        }
    }
    for constraint in &report.new_constraints {
        println!("  learned: {}", constraint.text);
    }
}

fn constraints_command(
    orchestrator: &LearningOrchestrator<JsonFileStore>,
    json: bool,
) -> Result<()> {
    let constraints = orchestrator.active_constraints();
    if json {
        println!("{}", serde_json::to_string_pretty(&constraints)?);
    } else {
        for constraint in &constraints {
            println!("{}", constraint.text);
        }
    }
    Ok(())
}

fn history_command(
    orchestrator: &LearningOrchestrator<JsonFileStore>,
    limit: Option<usize>,
) -> Result<()> {
    let history = orchestrator.memory().history();
    let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
    for entry in history.iter().skip(skip) {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn stats_command(orchestrator: &LearningOrchestrator<JsonFileStore>, json: bool) -> Result<()> {
    let stats = orchestrator.statistics();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "total_runs={} successful_runs={} total_mistakes={} learned_constraints={} improvement_rate={}",
            stats.total_runs,
            stats.successful_runs,
            stats.total_mistakes,
            stats.learned_constraints,
            stats.improvement_rate
        );
        for (pattern, count) in &stats.pattern_counts {
            println!("  {count}x {pattern}");
        }
    }
    Ok(())
}
