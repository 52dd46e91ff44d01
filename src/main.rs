//! Assembly Line CLI
//!
//! Runs a task through the phase pipeline, or administers checkpoints and
//! approvals for earlier runs.

use std::path::{Path, PathBuf};

use clap::Parser;

use assembly_line::approval::ApprovalStore;
use assembly_line::phases::catalogue;
use assembly_line::{
    AgentKind, CheckpointStore, Eligibility, EventSink, Orchestrator, PhaseKind, ProgressEvent,
    Result, Validate, WorkflowConfig, WorkflowContext,
};

#[derive(Parser)]
#[command(name = "assembly-line")]
#[command(version, about = "Resumable, cost-bounded agent workflow engine")]
struct Cli {
    /// Task description, or @path to a plan file
    task: Option<String>,

    /// Task name (defaults to a slug of the description or plan file name)
    #[arg(short, long)]
    name: Option<String>,

    /// Repository to work in (defaults to the current directory)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Spend limit in USD
    #[arg(short, long)]
    budget: Option<f64>,

    /// Primary agent backend
    #[arg(long, value_enum)]
    agent: Option<AgentKind>,

    /// Secondary agent backend, used for debate
    #[arg(long, value_enum)]
    secondary_agent: Option<AgentKind>,

    /// Model passed to the agent backends
    #[arg(long)]
    model: Option<String>,

    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start at this phase, skipping earlier ones
    #[arg(long)]
    skip_to: Option<String>,

    /// Resume the run recorded under this checkpoint id
    #[arg(long)]
    resume: Option<String>,

    /// Disable a phase (repeatable)
    #[arg(long = "disable-phase")]
    disable_phase: Vec<String>,

    /// Wait for human approval at gated phases
    #[arg(long)]
    require_approval: bool,

    /// Grant approval for a phase of the named task and exit
    #[arg(long, value_name = "PHASE")]
    approve: Option<String>,

    /// List checkpoints and exit
    #[arg(long)]
    list_checkpoints: bool,

    /// List the phase catalogue and exit
    #[arg(long)]
    list_phases: bool,

    /// Show the phases that would run and exit
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let repo = match &cli.repo {
        Some(repo) => repo.clone(),
        None => std::env::current_dir()?,
    };

    let mut config = match &cli.config {
        Some(path) => WorkflowConfig::load(path)?,
        None => WorkflowConfig::discover(&repo)?,
    };
    if let Some(budget) = cli.budget {
        config.budget_limit = budget;
    }
    if let Some(agent) = cli.agent {
        config.agent.primary = agent;
    }
    if let Some(agent) = cli.secondary_agent {
        config.agent.secondary = agent;
    }
    if cli.model.is_some() {
        config.agent.model = cli.model.clone();
    }
    if cli.require_approval {
        config.approvals.enabled = true;
    }
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "configuration warning");
    }

    for phase in cli.disable_phase.iter().chain(cli.skip_to.iter()) {
        known_phase(phase)?;
    }

    if cli.list_phases {
        print_phases(&config);
        return Ok(());
    }

    let checkpoints = CheckpointStore::new(config.workflow.checkpoints_dir(&repo));
    if cli.list_checkpoints {
        return print_checkpoints(&checkpoints);
    }

    if let Some(phase) = &cli.approve {
        known_phase(phase)?;
        let task_name = match (&cli.name, &cli.resume) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => checkpoints.load(id)?.context.task_name,
            (None, None) => {
                return Err(assembly_line::Error::Config(
                    "--approve needs --name or --resume to identify the task".into(),
                ))
            }
        };
        let record = ApprovalStore::new(config.workflow.approvals_dir(&repo)).grant(&task_name, phase)?;
        println!(
            "Approved {} for {} at {}",
            record.phase, record.task_name, record.granted_at
        );
        return Ok(());
    }

    let (events, rx) = EventSink::channel(256);
    let primary = config.agent.primary.create_executor(
        config.agent.cli_path(config.agent.primary),
        config.agent.model.as_deref(),
        events.clone(),
    );
    let secondary = config.agent.secondary.create_executor(
        config.agent.cli_path(config.agent.secondary),
        config.agent.model.as_deref(),
        events.clone(),
    );
    let orchestrator = Orchestrator::from_config(&config, &repo, primary, secondary, events);

    let mut ctx = match &cli.resume {
        Some(id) => {
            let mut ctx = orchestrator.resume(id)?;
            if let Some(budget) = cli.budget {
                ctx.ledger.set_budget_limit(budget);
            }
            ctx
        }
        None => new_context(&cli, &config, &repo)?,
    };
    if let Some(phase) = &cli.skip_to {
        ctx.skip_to = Some(phase.clone());
    }
    ctx.disabled_phases.extend(cli.disable_phase.iter().cloned());

    if cli.dry_run {
        return print_plan(&orchestrator, &ctx);
    }

    let printer = tokio::spawn(print_events(rx));
    let id = CheckpointStore::id_for(&ctx);
    println!("Checkpoint: {}", id);

    let result = orchestrator.run(&mut ctx).await;
    drop(orchestrator);
    let _ = printer.await;

    println!("\n{}", "=".repeat(60));
    match &result {
        Ok(()) => println!("Workflow Complete: {}", ctx.task_name),
        Err(_) => println!("Workflow Halted: {}", ctx.task_name),
    }
    println!("{}", "=".repeat(60));
    println!();
    println!(
        "Cost: ${:.2} of ${:.2}",
        ctx.ledger.spent_total(),
        ctx.ledger.budget_limit()
    );
    println!("Completed phases: {}", ctx.completed_phases.join(", "));
    if let Some(url) = &ctx.change_request_url {
        println!("Change request: {}", url);
    }
    if !ctx.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &ctx.warnings {
            println!("  {}", warning);
        }
    }
    if result.is_err() {
        println!();
        println!("Resume with: assembly-line --resume {}", id);
    }
    result
}

fn known_phase(name: &str) -> Result<()> {
    match PhaseKind::from_name(name) {
        Some(_) => Ok(()),
        None => Err(assembly_line::Error::Config(format!("unknown phase '{}'", name))),
    }
}

fn new_context(cli: &Cli, config: &WorkflowConfig, repo: &Path) -> Result<WorkflowContext> {
    let task = cli.task.as_deref().ok_or_else(|| {
        assembly_line::Error::Config("a task description or @plan file is required".into())
    })?;

    let (description, derived_name) = match task.strip_prefix('@') {
        Some(path) => {
            let path = repo.join(path);
            let description = std::fs::read_to_string(&path).map_err(|e| {
                assembly_line::Error::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            (description, slugify(&stem))
        }
        None => (task.to_string(), slugify(task)),
    };

    let name = cli.name.clone().unwrap_or(derived_name);
    if name.is_empty() {
        return Err(assembly_line::Error::Config(
            "could not derive a task name, pass --name".into(),
        ));
    }

    Ok(WorkflowContext::new(
        name,
        description,
        repo,
        config.workflow.artifacts_dir(repo),
        config.budget_limit,
    ))
}

/// Lowercase, dash-separated slug of at most five words.
fn slugify(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(5)
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

fn print_phases(config: &WorkflowConfig) {
    println!(
        "{:<20} {:>9} {:>8} {:>8} {:>9}",
        "PHASE", "ESTIMATE", "TIMEOUT", "ENABLED", "APPROVAL"
    );
    for phase in catalogue(config) {
        let def = phase.definition();
        println!(
            "{:<20} {:>9} {:>7}s {:>8} {:>9}",
            def.name,
            format!("${:.2}", def.estimated_cost),
            def.timeout.as_secs(),
            if def.enabled { "yes" } else { "no" },
            if def.requires_approval { "yes" } else { "no" },
        );
    }
}

fn print_checkpoints(store: &CheckpointStore) -> Result<()> {
    let summaries = store.list()?;
    if summaries.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(());
    }
    println!(
        "{:<21} {:<24} {:<20} {:<20} {:>8}  CREATED",
        "ID", "TASK", "NEXT PHASE", "STATUS", "COST"
    );
    for summary in summaries {
        println!(
            "{:<21} {:<24} {:<20} {:<20} {:>8}  {}",
            summary.id,
            summary.task_name,
            summary.next_phase.as_deref().unwrap_or("-"),
            summary.status.to_string(),
            format!("${:.2}", summary.cost),
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn print_plan(orchestrator: &Orchestrator, ctx: &WorkflowContext) -> Result<()> {
    let plan = orchestrator.plan(ctx)?;
    println!("Task: {}", ctx.task_name);
    println!();
    let mut total = 0.0;
    for phase in &plan {
        if phase.eligibility == Eligibility::Run {
            total += phase.estimated_cost;
            let gate = if phase.requires_approval { " (approval)" } else { "" };
            println!("  run   {:<20} ${:.2}{}", phase.name, phase.estimated_cost, gate);
        } else {
            println!("  skip  {:<20} {:?}", phase.name, phase.eligibility);
        }
    }
    println!();
    println!(
        "Estimated cost: ${:.2} (remaining budget ${:.2})",
        total,
        ctx.ledger.remaining()
    );
    Ok(())
}

async fn print_events(mut rx: tokio::sync::mpsc::Receiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::PhaseStarted { phase } => println!("==> {}", phase),
            ProgressEvent::PhaseSkipped { phase, reason } => {
                println!("--- {} skipped ({})", phase, reason)
            }
            ProgressEvent::PhaseCompleted { phase, cost } => {
                println!("<== {} done (${:.2})", phase, cost)
            }
            ProgressEvent::PhaseFailed { phase, error } => println!("!!! {} failed: {}", phase, error),
            ProgressEvent::AwaitingApproval { phase } => println!(
                "... {} awaits approval (assembly-line --approve {} --name <task>)",
                phase, phase
            ),
            ProgressEvent::DebateMessage {
                phase,
                speaker,
                number,
            } => println!("    {} debate message {} from {}", phase, number, speaker),
            ProgressEvent::AgentOutput { .. } | ProgressEvent::ToolCall { .. } => {}
        }
    }
}
