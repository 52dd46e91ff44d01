//! Phases that run project commands: tests, lints, final verification.

use async_trait::async_trait;

use crate::context::{ContextUpdate, WorkflowContext};
use crate::error::{Error, Result};
use crate::fixloop::{tail, BaselineFailureSet, FixLoopController};

use super::agent::{agent_failure, agent_request, resume_session, AgentFixer};
use super::prompts;
use super::{Phase, PhaseDefinition, PhaseEnv, PhaseResult};

const LINT_OUTPUT_TAIL: usize = 4000;
const BUILD_OUTPUT_TAIL: usize = 2000;

fn controller(def: &PhaseDefinition, env: &PhaseEnv, command: &str, ctx: &WorkflowContext) -> FixLoopController {
    FixLoopController::new(&def.name, env.runner.clone(), command, ctx.working_dir())
        .with_timeout(def.timeout)
        .with_max_iterations(def.max_iterations)
}

/// Runs the test suite with a bounded fix loop.
///
/// The first run of a workflow captures the baseline; it is returned as a
/// context update and reused from then on. Without a detected test command
/// the agent finds and runs the tests itself, and no baseline is kept.
pub struct TestExecutionPhase {
    definition: PhaseDefinition,
}

impl TestExecutionPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }

    async fn run_with_agent_detection(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        tracing::info!(phase = %def.name, "no test command detected, delegating to agent");
        let request = agent_request(
            def,
            prompts::test_detection_prompt(def.max_iterations.max(1)),
            ctx.working_dir(),
            resume_session(def, ctx),
        );
        let outcome = env.primary.execute(request).await?;

        let mut result = PhaseResult::ok()
            .with_cost(outcome.cost)
            .with_session(outcome.session_id.clone())
            .with_artifact("command", serde_json::Value::Null)
            .with_artifact("agent_detected", true)
            .with_warning("no test command detected, agent ran the tests without a failure baseline");
        if !outcome.success {
            result.failure = Some(agent_failure(&def.name, &outcome));
        }
        Ok(result)
    }
}

#[async_trait]
impl Phase for TestExecutionPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        let Some(command) = env.commands.test.as_deref() else {
            return self.run_with_agent_detection(env, ctx).await;
        };
        let controller = controller(def, env, command, ctx);

        let mut updates = ContextUpdate::default();
        let baseline = match &ctx.baseline {
            Some(baseline) => baseline.clone(),
            None => {
                let captured = controller
                    .capture_baseline(env.vcs.as_deref(), env.known_failures.clone())
                    .await?;
                updates.baseline = Some(captured.clone());
                captured
            }
        };

        let fixer = AgentFixer::new(&env.primary, def, ctx.working_dir(), resume_session(def, ctx));
        let report = controller.run(&baseline, &fixer).await?;

        let warnings = report.warnings();
        let mut result = PhaseResult::ok()
            .with_cost(report.cost)
            .with_session(report.session_id)
            .with_artifact("command", command)
            .with_artifact("fix_iterations", report.iterations)
            .with_artifact("baseline_failures", baseline.len())
            .with_artifact("preexisting_failures", report.preexisting);
        result.warnings = warnings;
        result.failure = report.failure;
        result.updates = updates;
        Ok(result)
    }
}

/// Runs lint and typecheck commands, asking the agent to fix failures.
pub struct LintPhase {
    definition: PhaseDefinition,
}

impl LintPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }

    async fn lint_loop(
        &self,
        env: &PhaseEnv,
        ctx: &WorkflowContext,
        checks: &[String],
        fixer: &AgentFixer<'_>,
        cost: &mut f64,
        iterations: &mut u32,
    ) -> Result<()> {
        let def = &self.definition;
        loop {
            let mut failing = Vec::new();
            for command in checks {
                let output = env.runner.run(command, ctx.working_dir(), def.timeout).await?;
                if !output.success() {
                    failing.push((command.clone(), tail(&output.output, LINT_OUTPUT_TAIL).to_string()));
                }
            }

            if failing.is_empty() {
                tracing::info!(phase = %def.name, iterations = *iterations, "checks pass");
                return Ok(());
            }

            let names: Vec<_> = failing.iter().map(|(c, _)| c.as_str()).collect();
            if *iterations >= def.max_iterations {
                return Err(Error::PhaseFailed {
                    phase: def.name.clone(),
                    reason: format!(
                        "{} still failing after {} fix attempt(s)",
                        names.join(", "),
                        iterations
                    ),
                });
            }

            *iterations += 1;
            tracing::info!(phase = %def.name, iteration = *iterations, failing = ?names, "attempting lint fix");
            let outcome = fixer.ask(prompts::lint_fix_prompt(&failing, *iterations)).await?;
            *cost += outcome.cost;
        }
    }
}

#[async_trait]
impl Phase for LintPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        let checks: Vec<String> = [env.commands.lint.clone(), env.commands.typecheck.clone()]
            .into_iter()
            .flatten()
            .collect();
        if checks.is_empty() {
            return Ok(PhaseResult::ok()
                .with_warning("no lint or typecheck command detected, lint check skipped"));
        }

        let fixer = AgentFixer::new(&env.primary, def, ctx.working_dir(), resume_session(def, ctx));
        let mut cost = 0.0;
        let mut iterations = 0;
        let outcome = self
            .lint_loop(env, ctx, &checks, &fixer, &mut cost, &mut iterations)
            .await;

        let mut result = PhaseResult::ok()
            .with_cost(cost)
            .with_session(fixer.session().await)
            .with_artifact("commands", checks)
            .with_artifact("fix_iterations", iterations);
        result.failure = outcome.err();
        Ok(result)
    }
}

/// Re-runs tests against the stored baseline, then builds strictly.
///
/// Never attempts fixes and never recaptures the baseline.
pub struct FinalVerificationPhase {
    definition: PhaseDefinition,
}

impl FinalVerificationPhase {
    pub fn new(definition: PhaseDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Phase for FinalVerificationPhase {
    fn definition(&self) -> &PhaseDefinition {
        &self.definition
    }

    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult> {
        let def = &self.definition;
        let mut result = PhaseResult::ok();

        match env.commands.test.as_deref() {
            Some(command) => {
                let baseline = match &ctx.baseline {
                    Some(baseline) => baseline.clone(),
                    None => {
                        result.warnings.push(
                            "no test baseline was captured, only known failures are tolerated"
                                .to_string(),
                        );
                        BaselineFailureSet::new(Vec::new(), env.known_failures.clone())
                    }
                };
                let report = controller(def, env, command, ctx).check(&baseline).await?;
                result.warnings.extend(report.warnings());
                result
                    .artifacts
                    .insert("tests_passed".into(), report.passed().into());
                if let Some(failure) = report.failure {
                    result.failure = Some(failure);
                    return Ok(result);
                }
            }
            None => result
                .warnings
                .push("no test command detected, tests not verified".to_string()),
        }

        match env.commands.build.as_deref() {
            Some(command) => {
                let output = env.runner.run(command, ctx.working_dir(), def.timeout).await?;
                result
                    .artifacts
                    .insert("build_passed".into(), output.success().into());
                if !output.success() {
                    tracing::error!(phase = %def.name, command = %command, code = ?output.exit_code, "build failed");
                    result.failure = Some(Error::PhaseFailed {
                        phase: def.name.clone(),
                        reason: format!(
                            "build command `{}` failed: {}",
                            command,
                            tail(output.output.trim(), BUILD_OUTPUT_TAIL)
                        ),
                    });
                }
            }
            None => result
                .warnings
                .push("no build command detected, build not verified".to_string()),
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{Reply, ScriptedExecutor};
    use crate::commands::DetectedCommands;
    use crate::fixloop::testing::ScriptedCommands;
    use crate::phases::PhaseKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    const AB: &str = "FAILED tests/a.py::test_a - boom\nFAILED tests/b.py::test_b\n2 failed";
    const ABC: &str =
        "FAILED tests/a.py::test_a - boom\nFAILED tests/b.py::test_b\nFAILED tests/c.py::test_c\n3 failed";

    fn context(dir: &std::path::Path) -> WorkflowContext {
        WorkflowContext::new("t", "Add a cache", dir, dir.join("plans"), 10.0)
    }

    fn commands() -> DetectedCommands {
        DetectedCommands {
            lint: Some("lint".into()),
            typecheck: None,
            test: Some("pytest".into()),
            build: Some("build".into()),
        }
    }

    fn env(agent: Arc<ScriptedExecutor>, runner: Arc<ScriptedCommands>) -> PhaseEnv {
        PhaseEnv::new(agent).with_runner(runner).with_commands(commands())
    }

    fn baseline_ab() -> BaselineFailureSet {
        BaselineFailureSet::new(
            vec!["tests/a.py::test_a".into(), "tests/b.py::test_b".into()],
            vec![],
        )
    }

    #[tokio::test]
    async fn first_test_run_captures_baseline_then_fixes_new_failure() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(ScriptedCommands::new().script("pytest", vec![(1, AB), (1, ABC), (1, AB)]));
        let phase = TestExecutionPhase::new(PhaseKind::TestExecution.default_definition());

        let result = phase
            .execute(&env(agent.clone(), runner.clone()), &context(dir.path()))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(runner.calls_to("pytest"), 3);
        assert_eq!(agent.calls(), 1);
        assert!(agent.prompts()[0].contains("tests/c.py::test_c"));
        assert_eq!(result.updates.baseline.as_ref().map(|b| b.len()), Some(2));
        assert_eq!(result.artifacts["fix_iterations"], 1);
        assert!((result.cost - 0.1).abs() < 1e-9);
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn stored_baseline_is_not_recaptured() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(ScriptedCommands::new().script("pytest", vec![(1, AB)]));
        let mut ctx = context(dir.path());
        ctx.baseline = Some(baseline_ab());

        let phase = TestExecutionPhase::new(PhaseKind::TestExecution.default_definition());
        let result = phase.execute(&env(agent.clone(), runner.clone()), &ctx).await.unwrap();

        assert!(result.success());
        assert_eq!(runner.calls_to("pytest"), 1);
        assert_eq!(agent.calls(), 0);
        assert!(result.updates.baseline.is_none());
    }

    #[tokio::test]
    async fn exhausted_fixes_fail_with_cost() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(ScriptedCommands::new().script("pytest", vec![(1, ABC)]));
        let mut ctx = context(dir.path());
        ctx.baseline = Some(baseline_ab());

        let mut def = PhaseKind::TestExecution.default_definition();
        def.max_iterations = 2;
        let result = TestExecutionPhase::new(def)
            .execute(&env(agent.clone(), runner), &ctx)
            .await
            .unwrap();

        match result.failure {
            Some(Error::TestsFailingAfterRetries { remaining, .. }) => {
                assert_eq!(remaining, vec!["tests/c.py::test_c".to_string()]);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(agent.calls(), 2);
        assert!((result.cost - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn final_verification_tolerates_baseline_but_builds_strictly() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(
            ScriptedCommands::new()
                .script("pytest", vec![(1, AB)])
                .script("build", vec![(2, "error: linker failed")]),
        );
        let mut ctx = context(dir.path());
        ctx.baseline = Some(baseline_ab());

        let phase = FinalVerificationPhase::new(PhaseKind::FinalVerification.default_definition());
        let result = phase.execute(&env(agent.clone(), runner), &ctx).await.unwrap();

        assert_eq!(result.artifacts["tests_passed"], true);
        assert_eq!(result.artifacts["build_passed"], false);
        assert!(matches!(result.failure, Some(Error::PhaseFailed { ref reason, .. }) if reason.contains("linker")));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn final_verification_fails_on_new_failure_without_fixing() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(ScriptedCommands::new().script("pytest", vec![(1, ABC)]));
        let mut ctx = context(dir.path());
        ctx.baseline = Some(baseline_ab());

        let phase = FinalVerificationPhase::new(PhaseKind::FinalVerification.default_definition());
        let result = phase.execute(&env(agent.clone(), runner.clone()), &ctx).await.unwrap();

        assert!(matches!(result.failure, Some(Error::TestsFailingAfterRetries { .. })));
        assert_eq!(agent.calls(), 0);
        assert_eq!(runner.calls_to("build"), 0);
    }

    #[tokio::test]
    async fn lint_failure_is_fixed_within_limit() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(
            ScriptedCommands::new().script("lint", vec![(1, "unused import"), (0, "")]),
        );

        let phase = LintPhase::new(PhaseKind::LintCheck.default_definition());
        let result = phase
            .execute(&env(agent.clone(), runner), &context(dir.path()))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(agent.calls(), 1);
        assert!(agent.prompts()[0].contains("unused import"));
        assert_eq!(result.artifacts["fix_iterations"], 1);
    }

    #[tokio::test]
    async fn lint_exhaustion_fails_phase_with_cost() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(ScriptedCommands::new().script("lint", vec![(1, "bad")]));

        let phase = LintPhase::new(PhaseKind::LintCheck.default_definition());
        let result = phase
            .execute(&env(agent.clone(), runner), &context(dir.path()))
            .await
            .unwrap();

        assert!(matches!(result.failure, Some(Error::PhaseFailed { .. })));
        assert_eq!(agent.calls(), 3);
        assert!((result.cost - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn runner_error_after_fix_keeps_cost_and_baseline() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let runner = Arc::new(
            ScriptedCommands::new()
                .script("pytest", vec![(1, AB), (1, ABC)])
                .broken_after("pytest", 2),
        );
        let phase = TestExecutionPhase::new(PhaseKind::TestExecution.default_definition());

        let result = phase
            .execute(&env(agent.clone(), runner.clone()), &context(dir.path()))
            .await
            .unwrap();

        assert!(matches!(result.failure, Some(Error::Io(_))));
        assert_eq!(agent.calls(), 1);
        assert_eq!(runner.calls_to("pytest"), 3);
        assert!((result.cost - 0.1).abs() < 1e-9);
        assert_eq!(result.updates.baseline.as_ref().map(|b| b.len()), Some(2));
        assert_eq!(result.session_id.as_deref(), Some("claude-session-1"));
    }

    #[tokio::test]
    async fn missing_test_command_delegates_to_agent() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(
            ScriptedExecutor::new("claude").with_replies(vec![Reply::ok("ran cargo test: 12 passed", 0.4)]),
        );
        let runner = Arc::new(ScriptedCommands::new());
        let env = PhaseEnv::new(agent.clone()).with_runner(runner.clone());

        let phase = TestExecutionPhase::new(PhaseKind::TestExecution.default_definition());
        let result = phase.execute(&env, &context(dir.path())).await.unwrap();

        assert!(result.success());
        assert_eq!(agent.calls(), 1);
        assert!(agent.prompts()[0].contains("Detect and run its tests"));
        assert!(agent.requests.lock().unwrap()[0].write_access);
        assert!(runner.calls.lock().unwrap().is_empty());
        assert!((result.cost - 0.4).abs() < 1e-9);
        assert!(result.updates.baseline.is_none());
        assert_eq!(result.artifacts["agent_detected"], true);
        assert!(result.warnings.iter().any(|w| w.contains("baseline")));
    }

    #[tokio::test]
    async fn agent_detected_test_failure_fails_phase_with_cost() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude").with_replies(vec![Reply::Fail {
            output: "3 tests still failing".into(),
            cost: 0.6,
        }]));
        let env = PhaseEnv::new(agent.clone()).with_runner(Arc::new(ScriptedCommands::new()));

        let phase = TestExecutionPhase::new(PhaseKind::TestExecution.default_definition());
        let result = phase.execute(&env, &context(dir.path())).await.unwrap();

        assert!(matches!(result.failure, Some(Error::PhaseFailed { ref reason, .. }) if reason.contains("still failing")));
        assert!((result.cost - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_commands_skip_with_warning() {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(ScriptedExecutor::new("claude"));
        let env = PhaseEnv::new(agent.clone()).with_runner(Arc::new(ScriptedCommands::new()));
        let ctx = context(dir.path());

        for phase in [
            Box::new(LintPhase::new(PhaseKind::LintCheck.default_definition())) as Box<dyn Phase>,
            Box::new(FinalVerificationPhase::new(
                PhaseKind::FinalVerification.default_definition(),
            )) as Box<dyn Phase>,
        ] {
            let result = phase.execute(&env, &ctx).await.unwrap();
            assert!(result.success());
            assert!(!result.warnings.is_empty());
        }
        assert_eq!(agent.calls(), 0);
    }
}
