//! Phases that talk to version control: setup, commit, rebase, change request.

use async_trait::async_trait;

use crate::checkpoint::checkpoint_id;
use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::vcs::VersionControl;

use super::agent::{resume_session, AgentFixer};
use super::prompts;
use super::{Phase, PhaseDefinition, PhaseEnv, PhaseKind, PhaseResult};

/// Longest subject line used in commit messages and titles.
const SUBJECT_MAX: usize = 72;

/// Branch for a run: `assembly/<task>-<short id>`.
pub fn branch_name(ctx: &WorkflowContext) -> String {
    let task: String = ctx
        .task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let id = checkpoint_id(&ctx.task_name, &ctx.started_at);
    let short = id.trim_start_matches("checkpoint_");
    format!("assembly/{}-{}", task, short)
}

/// First line of the task description, shortened for a subject line.
fn summary_line(ctx: &WorkflowContext) -> String {
    let line = ctx.task_description.lines().next().unwrap_or("").trim();
    if line.chars().count() <= SUBJECT_MAX {
        line.to_string()
    } else {
        let cut: String = line.chars().take(SUBJECT_MAX - 3).collect();
        format!("{}...", cut.trim_end())
    }
}

pub(crate) fn commit_message(ctx: &WorkflowContext) -> String {
    let summary = summary_line(ctx);
    if summary.is_empty() {
        ctx.task_name.clone()
    } else {
        format!("{}: {}", ctx.task_name, summary)
    }
}

fn change_request_body(ctx: &WorkflowContext) -> String {
    let mut body = format!("## Summary\n\n{}\n\n", ctx.task_description.trim());
    if let Some(plan) = ctx
        .artifact_file(PhaseKind::PlanReview.name(), "output_file")
        .or_else(|| ctx.artifact_file(PhaseKind::Planning.name(), "output_file"))
    {
        body.push_str(&format!("Implementation plan: `{}`\n\n", plan.display()));
    }
    body.push_str("## Workflow\n\n");
    body.push_str(&format!(
        "- Phases completed: {}\n",
        ctx.completed_phases.join(", ")
    ));
    body.push_str(&format!(
        "- Agent cost: ${:.2} of ${:.2} budget\n",
        ctx.ledger.spent_total(),
        ctx.ledger.budget_limit()
    ));
    if !ctx.warnings.is_empty() {
        body.push_str("\n## Warnings\n\n");
        for warning in &ctx.warnings {
            body.push_str(&format!("- {}\n", warning));
        }
    }
    body
}

fn no_vcs(phase: &str) -> PhaseResult {
    PhaseResult::ok().with_warning(format!("no version control configured, {} skipped", phase))
}

/// Creates the isolated workspace the rest of the run works in and writes
/// the project rules into it.
pub struct SetupPhase {
    definition: PhaseDefinition,
}

impl SetupPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Phase for SetupPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        if let Some(existing) = ctx.workspace_path.as_ref().filter(|p| p.exists()) {
            tracing::info!(path = ?existing, "reusing existing workspace");
            return Ok(PhaseResult::ok()
                .with_artifact("workspace_path", existing.to_string_lossy().to_string()));
        }
        let Some(vcs) = env.vcs.as_deref() else {
            return Ok(PhaseResult::ok()
                .with_warning("no version control configured, working in the repository"));
        };

        let branch = branch_name(ctx);
        let path = vcs.create_isolated_workspace(&branch)?;

        let mut result = PhaseResult::ok()
            .with_artifact("workspace_path", path.to_string_lossy().to_string())
            .with_artifact("branch", branch.clone());
        match env.rules.write_to(&path) {
            Ok(ids) => {
                result.artifacts.insert("rules".into(), ids.into());
            }
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "could not write project rules");
                result.failure = Some(e);
            }
        }
        result.updates.workspace_path = Some(path);
        result.updates.branch_name = Some(branch);
        Ok(result)
    }
}

/// Commits the workspace.
pub struct CommitPhase {
    definition: PhaseDefinition,
}

impl CommitPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Phase for CommitPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let Some(vcs) = env.vcs.as_deref() else {
            return Ok(no_vcs(&self.definition.name));
        };

        let message = commit_message(ctx);
        match vcs.commit(ctx.working_dir(), &message)? {
            Some(commit) => Ok(PhaseResult::ok()
                .with_artifact("commit_id", commit)
                .with_artifact("message", message)),
            None => Ok(PhaseResult::ok().with_warning("nothing to commit")),
        }
    }
}

/// Rebases onto the base branch, letting the agent resolve conflicts.
pub struct ConflictPhase {
    definition: PhaseDefinition,
}

impl ConflictPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }

    async fn resolve(
        &self,
        vcs: &dyn VersionControl,
        fixer: &AgentFixer<'_>,
        ctx: &WorkflowContext,
        base: &str,
        mut files: Vec<String>,
        cost: &mut f64,
    ) -> Result<Vec<String>> {
        let def = &self.definition;
        let ws = ctx.working_dir();
        let mut resolved = Vec::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            tracing::info!(phase = %def.name, round = rounds, files = ?files, "resolving conflicts");
            let outcome = fixer.ask(prompts::conflict_prompt(&files, base)).await?;
            *cost += outcome.cost;
            if !outcome.success {
                return Err(Error::Conflict { files });
            }
            resolved.extend(files.iter().cloned());

            match vcs.continue_rebase(ws) {
                Ok(()) => return Ok(resolved),
                Err(Error::Conflict { files: next }) if rounds < def.max_iterations => files = next,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Phase for ConflictPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        let Some(vcs) = env.vcs.as_deref() else {
            return Ok(no_vcs(&def.name));
        };
        let ws = ctx.working_dir();

        let files = match vcs.rebase_onto(ws, &env.base_branch) {
            Ok(()) => return Ok(PhaseResult::ok().with_artifact("conflicts", 0)),
            Err(Error::Conflict { files }) => files,
            Err(e) => return Err(e),
        };

        if def.max_iterations == 0 {
            abort(vcs, ws);
            return Ok(PhaseResult::failed(Error::Conflict { files }));
        }

        let fixer = AgentFixer::new(&env.primary, def, ws, resume_session(def, ctx));
        let mut cost = 0.0;
        let outcome = self
            .resolve(vcs, &fixer, ctx, &env.base_branch, files, &mut cost)
            .await;

        let result = PhaseResult::ok()
            .with_cost(cost)
            .with_session(fixer.session().await);
        match outcome {
            Ok(resolved) => Ok(result
                .with_artifact("conflicts", resolved.len())
                .with_artifact("resolved_files", resolved)),
            Err(e) => {
                abort(vcs, ws);
                let mut result = result;
                result.failure = Some(e);
                Ok(result)
            }
        }
    }
}

fn abort(vcs: &dyn VersionControl, ws: &std::path::Path) {
    if let Err(e) = vcs.abort_rebase(ws) {
        tracing::warn!(error = %e, "failed to abort rebase");
    }
}

/// Pushes the branch and opens a change request.
pub struct PullRequestPhase {
    definition: PhaseDefinition,
}

impl PullRequestPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Phase for PullRequestPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let Some(vcs) = env.vcs.as_deref() else {
            return Ok(no_vcs(&self.definition.name));
        };
        let Some(branch) = ctx.branch_name.as_deref() else {
            return Ok(PhaseResult::ok()
                .with_warning("no workspace branch, change request not opened"));
        };

        let url = vcs.push_and_open_change_request(
            ctx.working_dir(),
            branch,
            &env.base_branch,
            &commit_message(ctx),
            &change_request_body(ctx),
        )?;

        let mut result = PhaseResult::ok().with_artifact("url", url.clone());
        result.updates.change_request_url = Some(url);
        Ok(result)
    }
}
