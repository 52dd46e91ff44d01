//! Workflow integration tests.
//!
//! These drive the full phase catalogue against throwaway git repositories
//! with scripted agents in place of real CLIs. Run with:
//! `cargo test --test workflow_test`

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use assembly_line::approval::ApprovalStore;
use assembly_line::{
    AgentExecutor, AgentOutcome, AgentRequest, CheckpointStore, DetectedCommands, Error,
    EventSink, Orchestrator, PhaseKind, RunStatus, SharedExecutor, WorkflowConfig,
    WorkflowContext,
};

/// Agent that succeeds at a fixed cost. With write access it leaves a file
/// in its working directory.
struct ScriptedAgent {
    name: String,
    cost: f64,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn new(name: &str, cost: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cost,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, request: AgentRequest) -> assembly_line::Result<AgentOutcome> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if request.write_access {
            std::fs::write(
                request.working_dir.join(format!("change-{}.txt", n)),
                format!("edit {}\n", n),
            )?;
        }
        Ok(AgentOutcome {
            success: true,
            cost: self.cost,
            output: format!("# {} output {}\n", self.name, n),
            artifacts: Default::default(),
            session_id: Some(format!("{}-session-{}", self.name, n)),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn create_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    let git = |args: &[&str]| {
        let output = Command::new("git")
            .current_dir(dir.path())
            .args(args)
            .output()
            .expect("failed to run git");
        assert!(output.status.success(), "git {:?} failed", args);
    };
    git(&["init", "-b", "main"]);
    git(&["config", "user.email", "test@test.com"]);
    git(&["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
    std::fs::write(dir.path().join(".gitignore"), ".assembly-line/\nplans/\n").unwrap();
    git(&["add", "-A"]);
    git(&["commit", "-m", "Initial"]);
    dir
}

fn config(worktrees: &Path) -> WorkflowConfig {
    let mut config = WorkflowConfig::default();
    config.commands = DetectedCommands {
        lint: Some("true".into()),
        typecheck: None,
        test: Some("true".into()),
        build: Some("true".into()),
    };
    config.workflow.worktree_base = Some(worktrees.to_path_buf());
    config
}

fn orchestrator(config: &WorkflowConfig, repo: &Path, agent: &Arc<ScriptedAgent>) -> Orchestrator {
    let primary: SharedExecutor = agent.clone();
    let secondary: SharedExecutor = ScriptedAgent::new("codex", 0.0);
    Orchestrator::from_config(config, repo, primary, secondary, EventSink::none())
}

fn context(config: &WorkflowConfig, repo: &Path, budget: f64) -> WorkflowContext {
    WorkflowContext::new(
        "add-cache",
        "Add a read-through cache",
        repo,
        config.workflow.artifacts_dir(repo),
        budget,
    )
}

/// Every phase except `keep`.
fn all_but(keep: &[&str]) -> Vec<&'static str> {
    PhaseKind::all()
        .iter()
        .map(|k| k.name())
        .filter(|name| !keep.contains(name))
        .collect()
}

#[tokio::test]
async fn full_pipeline_completes_in_isolated_workspace() {
    let repo = create_repo();
    let worktrees = TempDir::new().unwrap();
    let config = config(worktrees.path());
    let agent = ScriptedAgent::new("claude", 0.1);
    let orchestrator = orchestrator(&config, repo.path(), &agent);
    let mut ctx = context(&config, repo.path(), 10.0).with_disabled_phases(["pr_creation"]);

    orchestrator.run(&mut ctx).await.unwrap();

    // research, planning, plan_review, implementation, test_writing,
    // code_review, fix_review_issues, documentation
    assert_eq!(agent.calls(), 8);
    assert!((ctx.ledger.spent_total() - 0.8).abs() < 1e-9);
    assert_eq!(ctx.completed_phases.len(), 14);
    assert!(!ctx.is_completed("pr_creation"));

    let workspace = ctx.workspace_path.clone().unwrap();
    assert!(workspace.starts_with(worktrees.path()));
    assert!(workspace.join("CLAUDE.md").is_file());
    assert!(ctx.branch_name.as_deref().unwrap().starts_with("assembly/add-cache-"));
    assert!(ctx.artifact("commit_prep", "commit_id").is_some());

    let plan = repo.path().join("plans/plan-add-cache.md");
    assert!(std::fs::read_to_string(plan).unwrap().contains("claude output"));
    assert!(ctx.baseline.as_ref().unwrap().is_empty());

    let checkpoint = orchestrator
        .checkpoints()
        .load(&CheckpointStore::id_for(&ctx))
        .unwrap();
    assert_eq!(checkpoint.status, RunStatus::Completed);
    assert_eq!(checkpoint.context.completed_phases, ctx.completed_phases);
}

#[tokio::test]
async fn resumed_run_reruns_nothing() {
    let repo = create_repo();
    let worktrees = TempDir::new().unwrap();
    let config = config(worktrees.path());
    let agent = ScriptedAgent::new("claude", 0.25);
    let orchestrator = orchestrator(&config, repo.path(), &agent);
    let mut ctx = context(&config, repo.path(), 10.0)
        .with_disabled_phases(all_but(&["research", "planning", "implementation"]));
    orchestrator.run(&mut ctx).await.unwrap();
    assert_eq!(agent.calls(), 3);

    let mut resumed = orchestrator.resume(&CheckpointStore::id_for(&ctx)).unwrap();
    orchestrator.run(&mut resumed).await.unwrap();

    assert_eq!(agent.calls(), 3);
    assert_eq!(resumed.ledger.phase_costs(), ctx.ledger.phase_costs());
}

#[tokio::test]
async fn small_budget_halts_before_spending_then_resumes() {
    let repo = create_repo();
    let worktrees = TempDir::new().unwrap();
    let config = config(worktrees.path());
    let agent = ScriptedAgent::new("claude", 0.3);
    let orchestrator = orchestrator(&config, repo.path(), &agent);
    let mut ctx = context(&config, repo.path(), 0.4)
        .with_disabled_phases(all_but(&["research", "planning"]));

    let err = orchestrator.run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, Error::InsufficientBudget { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(agent.calls(), 0);

    let id = CheckpointStore::id_for(&ctx);
    let checkpoint = orchestrator.checkpoints().load(&id).unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert_eq!(checkpoint.next_phase.as_deref(), Some("research"));

    let mut resumed = orchestrator.resume(&id).unwrap();
    resumed.ledger.set_budget_limit(5.0);
    orchestrator.run(&mut resumed).await.unwrap();

    assert_eq!(agent.calls(), 2);
    assert!((resumed.ledger.spent_total() - 0.6).abs() < 1e-9);
    assert_eq!(resumed.completed_phases, vec!["research", "planning"]);
}

#[tokio::test]
async fn pre_granted_approval_unblocks_gated_phase() {
    let repo = create_repo();
    let worktrees = TempDir::new().unwrap();
    let mut config = config(worktrees.path());
    config.approvals.enabled = true;
    let agent = ScriptedAgent::new("claude", 0.1);
    let orchestrator = orchestrator(&config, repo.path(), &agent);
    let mut ctx = context(&config, repo.path(), 5.0).with_disabled_phases(all_but(&["planning"]));

    ApprovalStore::new(config.workflow.approvals_dir(repo.path()))
        .grant("add-cache", "planning")
        .unwrap();
    orchestrator.run(&mut ctx).await.unwrap();

    assert_eq!(agent.calls(), 1);
    assert!(ctx.is_completed("planning"));
}

#[tokio::test]
async fn skip_to_starts_at_target_phase() {
    let repo = create_repo();
    let worktrees = TempDir::new().unwrap();
    let config = config(worktrees.path());
    let agent = ScriptedAgent::new("claude", 0.1);
    let orchestrator = orchestrator(&config, repo.path(), &agent);
    let mut ctx = context(&config, repo.path(), 5.0)
        .with_disabled_phases(all_but(&["research", "planning", "plan_review"]))
        .with_skip_to("plan_review");

    orchestrator.run(&mut ctx).await.unwrap();

    assert_eq!(agent.calls(), 1);
    assert_eq!(ctx.completed_phases, vec!["plan_review"]);
    assert_eq!(ctx.skip_to, None);
}

#[test]
fn config_file_round_trips_through_discovery() {
    let repo = TempDir::new().unwrap();
    std::fs::write(
        repo.path().join(".assembly-line.yaml"),
        "budget_limit: 3.5\nphases:\n  documentation:\n    enabled: false\n",
    )
    .unwrap();

    let config = WorkflowConfig::discover(repo.path()).unwrap();
    assert_eq!(config.budget_limit, 3.5);
    assert!(!PhaseKind::Documentation.definition(&config).enabled);
}
