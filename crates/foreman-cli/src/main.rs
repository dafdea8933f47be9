mod config;
mod logging;

use clap::{ArgAction, Parser, Subcommand};
use foreman_agent::{
    ChannelEventEmitter, CommandPlanner, Coordinator, EventEmitter, IntegrationReport,
    IntegrationStatus, NoopEventEmitter, Planner, ScriptedPlanner, Session, SessionEvent,
    SessionOutcome, SessionServices, SessionSpec, SessionStatus, SpecialistAssignment,
    TaskLedger, ToolRegistry,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const PLANNER_CMD_ENV: &str = "FOREMAN_PLANNER_CMD";

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(about = "Runs goals to completion through a sandboxed plan/act loop")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single session against a goal.
    Run(RunArgs),
    /// Fan a list of specialist assignments out in parallel.
    Coordinate(CoordinateArgs),
    /// Print the built-in tool catalogue.
    Tools,
}

#[derive(clap::Args, Debug)]
struct PlannerArgs {
    /// External planner program; reads the request JSON on stdin.
    /// Falls back to `FOREMAN_PLANNER_CMD`.
    #[arg(long)]
    planner_cmd: Option<String>,
    #[arg(long = "planner-arg")]
    planner_args: Vec<String>,
    /// JSON array of canned planner replies, replayed in order.
    #[arg(long)]
    script: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    goal: String,
    #[arg(long)]
    root: PathBuf,
    #[command(flatten)]
    planner: PlannerArgs,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_steps: Option<usize>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct CoordinateArgs {
    /// JSON array of `{ "focus", "instructions", "context"?, "step_budget"? }`.
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    root: PathBuf,
    #[command(flatten)]
    planner: PlannerArgs,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_parallel: Option<usize>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    logging::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Coordinate(args) => coordinate_command(args).await,
        Commands::Tools => tools_command(),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let mut file_config = config::load(args.config.as_deref())?;
    if let Some(max_steps) = args.max_steps {
        file_config.session.max_steps = max_steps;
    }
    let planner = build_planner(&args.planner)?;
    let (emitter, event_task) = event_stream(args.event_json);

    let spec = SessionSpec::new(args.goal, args.root)
        .with_config(file_config.session.clone())
        .with_policy(file_config.commands.clone());
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    let ledger = Arc::new(TaskLedger::new());
    let coordinator = Coordinator::new(
        planner.clone(),
        registry.clone(),
        ledger.clone(),
        file_config.coordinator.clone(),
    )
    .with_emitter(emitter.clone())
    .with_session_config(file_config.session.clone())
    .with_policy(file_config.commands.clone());
    let services = SessionServices::new(planner, registry, ledger)
        .with_emitter(emitter)
        .with_delegator(Arc::new(coordinator));

    let mut session = Session::new(spec, services).map_err(|error| error.to_string())?;
    let outcome = session.run().await.map_err(|error| error.to_string());
    // Dropping the session closes the event channel so the printer can finish.
    drop(session);
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }
    let outcome = outcome?;

    if args.json {
        let json = serde_json::to_string_pretty(&outcome).map_err(|error| error.to_string())?;
        println!("{json}");
    } else {
        print_session_summary(&outcome);
    }
    Ok(exit_code_for_status(outcome.status))
}

async fn coordinate_command(args: CoordinateArgs) -> Result<ExitCode, String> {
    let mut file_config = config::load(args.config.as_deref())?;
    if let Some(max_parallel) = args.max_parallel {
        file_config.coordinator.max_parallel = max_parallel;
    }
    let assignments = load_assignments(&args.plan)?;
    let planner = build_planner(&args.planner)?;
    let (emitter, event_task) = event_stream(args.event_json);

    let coordinator = Coordinator::new(
        planner,
        Arc::new(ToolRegistry::with_builtin_tools()),
        Arc::new(TaskLedger::new()),
        file_config.coordinator,
    )
    .with_emitter(emitter)
    .with_session_config(file_config.session)
    .with_policy(file_config.commands);

    let report = coordinator
        .run(assignments, &args.root)
        .await
        .map_err(|error| error.to_string());
    drop(coordinator);
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }
    let report = report?;

    let json = serde_json::to_string_pretty(&report).map_err(|error| error.to_string())?;
    println!("{json}");
    Ok(exit_code_for_report(&report))
}

fn tools_command() -> Result<ExitCode, String> {
    let definitions = ToolRegistry::with_builtin_tools().definitions();
    let json = serde_json::to_string_pretty(&definitions).map_err(|error| error.to_string())?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

fn build_planner(args: &PlannerArgs) -> Result<Arc<dyn Planner>, String> {
    let env_command = std::env::var(PLANNER_CMD_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty());
    match (&args.script, args.planner_cmd.clone().or(env_command)) {
        (Some(_), Some(_)) if args.planner_cmd.is_some() => {
            Err("provide only one of --script or --planner-cmd".to_string())
        }
        (Some(path), _) => Ok(Arc::new(ScriptedPlanner::new(load_script(path)?))),
        (None, Some(program)) => Ok(Arc::new(CommandPlanner::new(
            program,
            args.planner_args.clone(),
        ))),
        (None, None) => Err(format!(
            "one of --script or --planner-cmd (or {PLANNER_CMD_ENV}) is required"
        )),
    }
}

/// Entries may be raw reply strings or JSON objects, which are re-serialised.
fn load_script(path: &Path) -> Result<Vec<String>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("failed reading script '{}': {error}", path.display()))?;
    let entries: Vec<Value> = serde_json::from_str(&raw)
        .map_err(|error| format!("script '{}' must be a JSON array: {error}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect())
}

fn load_assignments(path: &Path) -> Result<Vec<SpecialistAssignment>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("failed reading plan '{}': {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("invalid plan '{}': {error}", path.display()))
}

fn event_stream(
    event_json: bool,
) -> (Arc<dyn EventEmitter>, Option<tokio::task::JoinHandle<()>>) {
    if !event_json {
        return (Arc::new(NoopEventEmitter), None);
    }

    let (emitter, mut receiver) = ChannelEventEmitter::new();
    let task = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            print_event(&event);
        }
    });
    (Arc::new(emitter), Some(task))
}

fn print_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(error) => eprintln!("warning: unprintable event: {error}"),
    }
}

fn print_session_summary(outcome: &SessionOutcome) {
    println!("session_id: {}", outcome.session_id);
    println!("status: {}", outcome.status);
    println!("steps: {}", outcome.steps);
    if let Some(report) = outcome.quality.as_ref() {
        println!("quality: {}", report.render());
    }
    println!("summary: {}", outcome.summary());
}

fn exit_code_for_status(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Done => ExitCode::SUCCESS,
        SessionStatus::MaxSteps => ExitCode::from(2),
        SessionStatus::Failed | SessionStatus::Init | SessionStatus::Running => ExitCode::from(3),
    }
}

fn exit_code_for_report(report: &IntegrationReport) -> ExitCode {
    match report.status {
        IntegrationStatus::Complete => ExitCode::SUCCESS,
        IntegrationStatus::Partial => ExitCode::from(2),
    }
}
