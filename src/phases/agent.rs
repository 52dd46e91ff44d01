//! Agent-driven phases and the agent-backed fixer used by retry loops.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::agent::{AgentOutcome, AgentRequest, SharedExecutor};
use crate::context::WorkflowContext;
use crate::debate::files::file_prefix;
use crate::debate::{DebateOrchestrator, DebatePromptBuilder, DebateTask};
use crate::error::{Error, Result};
use crate::fixloop::{tail, FailureFixer, FixAttempt};

use super::prompts;
use super::{Phase, PhaseDefinition, PhaseEnv, PhaseKind, PhaseResult};

/// Bytes of test output handed to the agent.
const FIX_OUTPUT_TAIL: usize = 8000;

/// Session the phase should continue, or `None` for a fresh context.
pub(crate) fn resume_session(def: &PhaseDefinition, ctx: &WorkflowContext) -> Option<String> {
    if def.fresh_context {
        None
    } else {
        ctx.latest_session_id().map(str::to_string)
    }
}

pub(crate) fn agent_request(
    def: &PhaseDefinition,
    prompt: String,
    working_dir: &Path,
    resume: Option<String>,
) -> AgentRequest {
    AgentRequest::new(prompt, working_dir)
        .with_allowed_tools(def.allowed_tools.clone())
        .with_timeout(def.timeout)
        .with_max_turns(def.max_turns)
        .with_resume_session(resume)
        .with_write_access(def.requires_write)
}

pub(crate) fn agent_failure(phase: &str, outcome: &AgentOutcome) -> Error {
    Error::PhaseFailed {
        phase: phase.to_string(),
        reason: format!("agent reported failure: {}", tail(outcome.output.trim(), 500)),
    }
}

/// Path of a phase's output file.
pub(crate) fn output_path(ctx: &WorkflowContext, phase: &str) -> PathBuf {
    ctx.artifacts_dir
        .join(format!("{}-{}.md", file_prefix(phase), ctx.task_name))
}

fn write_output(ctx: &WorkflowContext, phase: &str, output: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(&ctx.artifacts_dir)?;
    let path = output_path(ctx, phase);
    std::fs::write(&path, output)?;
    Ok(path)
}

/// A phase carried out by one agent call, or by the debate orchestrator.
pub struct AgentPhase {
    kind: PhaseKind,
    definition: PhaseDefinition,
}

impl AgentPhase {
    pub fn new(kind: PhaseKind, definition: PhaseDefinition) -> Self {
        Self { kind, definition }
    }

    async fn run_single(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        let prompt = prompts::phase_prompt(self.kind, ctx);
        let request = agent_request(def, prompt, ctx.working_dir(), resume_session(def, ctx));

        let outcome = env.primary.execute(request).await?;
        if !outcome.success {
            return Ok(PhaseResult::failed(agent_failure(&def.name, &outcome))
                .with_cost(outcome.cost));
        }

        let path = match write_output(ctx, &def.name, &outcome.output) {
            Ok(path) => path,
            Err(e) => return Ok(PhaseResult::failed(e).with_cost(outcome.cost)),
        };

        let mut result = PhaseResult::ok()
            .with_cost(outcome.cost)
            .with_session(outcome.session_id.clone());
        result.artifacts = outcome.artifacts;
        Ok(result
            .with_artifact("output_file", path.to_string_lossy().to_string())
            .with_artifact("agent", env.primary.name()))
    }

    async fn run_debate(
        &self,
        debate: &DebateOrchestrator,
        ctx: &WorkflowContext,
    ) -> Result<PhaseResult> {
        let def = &self.definition;
        let prompts = prompts::context_files(self.kind, ctx).into_iter().fold(
            DebatePromptBuilder::new(&def.name, &ctx.task_description)
                .with_brief(prompts::brief(self.kind)),
            |builder, file| builder.with_context_file(file),
        );
        let task = DebateTask {
            phase: def.name.clone(),
            task_name: ctx.task_name.clone(),
            prompts,
            working_dir: ctx.working_dir().to_path_buf(),
            artifacts_dir: ctx.artifacts_dir.clone(),
            allowed_tools: def.allowed_tools.clone(),
            max_turns: def.max_turns,
            resume_session: resume_session(def, ctx),
        };

        let outcome = debate.run(&task).await?;
        Ok(PhaseResult {
            cost: outcome.cost,
            failure: outcome.failure,
            artifacts: outcome.artifacts,
            warnings: Vec::new(),
            session_id: outcome.session_id,
            updates: Default::default(),
        })
    }
}

#[async_trait]
impl Phase for AgentPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        match env.debate_for(&self.definition) {
            Some(debate) => self.run_debate(debate, ctx).await,
            None => self.run_single(env, ctx).await,
        }
    }
}

/// Asks the primary agent for follow-up work inside one phase.
///
/// Calls continue one session, starting from `initial_session`.
pub(crate) struct AgentFixer<'a> {
    executor: &'a SharedExecutor,
    definition: &'a PhaseDefinition,
    working_dir: &'a Path,
    session: Mutex<Option<String>>,
}

impl<'a> AgentFixer<'a> {
    pub(crate) fn new(
        executor: &'a SharedExecutor,
        definition: &'a PhaseDefinition,
        working_dir: &'a Path,
        initial_session: Option<String>,
    ) -> Self {
        Self {
            executor,
            definition,
            working_dir,
            session: Mutex::new(initial_session),
        }
    }

    pub(crate) async fn ask(&self, prompt: String) -> Result<AgentOutcome> {
        let mut session = self.session.lock().await;
        let request = agent_request(self.definition, prompt, self.working_dir, session.clone());
        let outcome = self.executor.execute(request).await?;
        if outcome.session_id.is_some() {
            *session = outcome.session_id.clone();
        }
        Ok(outcome)
    }

    pub(crate) async fn session(&self) -> Option<String> {
        self.session.lock().await.clone()
    }
}

#[async_trait]
impl FailureFixer for AgentFixer<'_> {
    async fn fix(
        &self,
        new_failures: &[String],
        test_output: &str,
        iteration: u32,
    ) -> Result<FixAttempt> {
        let prompt =
            prompts::test_fix_prompt(new_failures, tail(test_output, FIX_OUTPUT_TAIL), iteration);
        let outcome = self.ask(prompt).await?;
        Ok(FixAttempt {
            cost: outcome.cost,
            success: outcome.success,
            session_id: outcome.session_id,
        })
    }
}
