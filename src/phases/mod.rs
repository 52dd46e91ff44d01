//! Phase catalogue and the closed set of phase variants.
//!
//! Each phase carries a static [`PhaseDefinition`] and implements [`Phase`].
//! The sequencer depends only on that trait and looks phases up by name.

mod agent;
mod delivery;
mod prompts;
mod verify;

pub use agent::AgentPhase;
pub use delivery::{CommitPhase, ConflictPhase, PullRequestPhase, SetupPhase};
pub use verify::{FinalVerificationPhase, LintPhase, TestExecutionPhase};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::SharedExecutor;
use crate::commands::DetectedCommands;
use crate::config::{PhaseOverride, RulesConfig, WorkflowConfig};
use crate::context::{ContextUpdate, PhaseArtifacts, WorkflowContext};
use crate::debate::DebateOrchestrator;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::fixloop::{CommandRunner, ShellCommandRunner};
use crate::vcs::VersionControl;

/// Tools for phases that only inspect the codebase.
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch"];

/// Tools for phases that change the workspace.
pub const WRITE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep", "LS"];

/// Every phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Setup,
    Research,
    Planning,
    PlanReview,
    Implementation,
    TestWriting,
    TestExecution,
    CodeReview,
    FixReviewIssues,
    LintCheck,
    Documentation,
    FinalVerification,
    CommitPrep,
    ConflictCheck,
    PrCreation,
}

impl PhaseKind {
    /// All phases in order.
    pub fn all() -> &'static [PhaseKind] {
        use PhaseKind::*;
        &[
            Setup,
            Research,
            Planning,
            PlanReview,
            Implementation,
            TestWriting,
            TestExecution,
            CodeReview,
            FixReviewIssues,
            LintCheck,
            Documentation,
            FinalVerification,
            CommitPrep,
            ConflictCheck,
            PrCreation,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Setup => "setup",
            PhaseKind::Research => "research",
            PhaseKind::Planning => "planning",
            PhaseKind::PlanReview => "plan_review",
            PhaseKind::Implementation => "implementation",
            PhaseKind::TestWriting => "test_writing",
            PhaseKind::TestExecution => "test_execution",
            PhaseKind::CodeReview => "code_review",
            PhaseKind::FixReviewIssues => "fix_review_issues",
            PhaseKind::LintCheck => "lint_check",
            PhaseKind::Documentation => "documentation",
            PhaseKind::FinalVerification => "final_verification",
            PhaseKind::CommitPrep => "commit_prep",
            PhaseKind::ConflictCheck => "conflict_check",
            PhaseKind::PrCreation => "pr_creation",
        }
    }

    pub fn from_name(name: &str) -> Option<PhaseKind> {
        PhaseKind::all().iter().copied().find(|k| k.name() == name)
    }

    /// Zero-based position in the catalogue.
    pub fn position(&self) -> usize {
        PhaseKind::all()
            .iter()
            .position(|k| k == self)
            .unwrap_or_default()
    }

    /// Whether the phase only reads the workspace.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            PhaseKind::Research | PhaseKind::Planning | PhaseKind::PlanReview | PhaseKind::CodeReview
        )
    }

    /// Built-in definition before configuration is applied.
    pub fn default_definition(&self) -> PhaseDefinition {
        use PhaseKind::*;
        // timeout secs, max turns, estimated cost
        let (timeout, max_turns, estimated_cost) = match self {
            Setup => (120, 0, 0.0),
            Research => (300, 25, 0.5),
            Planning => (600, 20, 1.0),
            PlanReview => (600, 30, 1.0),
            Implementation => (3600, 100, 3.0),
            TestWriting => (1200, 50, 1.5),
            TestExecution => (1800, 60, 2.0),
            CodeReview => (600, 30, 1.0),
            FixReviewIssues => (900, 40, 1.0),
            LintCheck => (300, 20, 0.5),
            Documentation => (600, 30, 0.5),
            FinalVerification => (300, 15, 0.5),
            CommitPrep => (300, 10, 0.3),
            ConflictCheck => (300, 20, 0.5),
            PrCreation => (300, 15, 0.3),
        };
        let tools = if self.is_read_only() {
            READ_ONLY_TOOLS
        } else {
            WRITE_TOOLS
        };
        PhaseDefinition {
            name: self.name().to_string(),
            position: self.position(),
            timeout: Duration::from_secs(timeout),
            max_turns,
            estimated_cost,
            enabled: true,
            requires_approval: *self == Planning,
            fresh_context: matches!(self, Research | PlanReview | CodeReview | TestWriting),
            requires_write: !self.is_read_only() && *self != Setup,
            allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
            debate_capable: self.is_read_only(),
            max_iterations: match self {
                TestExecution => 5,
                LintCheck | ConflictCheck => 3,
                _ => 0,
            },
        }
    }

    /// Definition with configuration overrides and approval gates applied.
    pub fn definition(&self, config: &WorkflowConfig) -> PhaseDefinition {
        let mut def = self.default_definition();
        if let Some(overrides) = config.phase_override(self.name()) {
            def.apply_override(overrides);
        }
        if let Some(gated) = config.approvals.gates.get(self.name()) {
            def.requires_approval = *gated;
        }
        def
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Static configuration of one phase. Immutable for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDefinition {
    pub name: String,
    pub position: usize,
    pub timeout: Duration,
    pub max_turns: u32,
    pub estimated_cost: f64,
    pub enabled: bool,
    pub requires_approval: bool,
    /// Start the agent without the prior phase's session.
    pub fresh_context: bool,
    pub requires_write: bool,
    pub allowed_tools: Vec<String>,
    /// Whether the debate orchestrator may run this phase.
    pub debate_capable: bool,
    /// Fix attempts for phases with an internal retry loop.
    pub max_iterations: u32,
}

impl PhaseDefinition {
    /// A minimal definition, used for custom phases.
    pub fn new(name: impl Into<String>, position: usize) -> Self {
        Self {
            name: name.into(),
            position,
            timeout: Duration::from_secs(600),
            max_turns: 30,
            estimated_cost: 0.0,
            enabled: true,
            requires_approval: false,
            fresh_context: true,
            requires_write: false,
            allowed_tools: Vec::new(),
            debate_capable: false,
            max_iterations: 0,
        }
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_requires_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    pub fn apply_override(&mut self, overrides: &PhaseOverride) {
        if let Some(secs) = overrides.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(turns) = overrides.max_turns {
            self.max_turns = turns;
        }
        if let Some(cost) = overrides.estimated_cost {
            self.estimated_cost = cost;
        }
        if let Some(enabled) = overrides.enabled {
            self.enabled = enabled;
        }
        if let Some(iterations) = overrides.max_iterations {
            self.max_iterations = iterations;
        }
    }
}

/// What a phase hands back to the sequencer.
///
/// `cost` is complete even when `failure` is set, so the sequencer can
/// charge it before halting.
#[derive(Debug, Default)]
pub struct PhaseResult {
    pub cost: f64,
    pub failure: Option<Error>,
    pub artifacts: PhaseArtifacts,
    pub warnings: Vec<String>,
    pub session_id: Option<String>,
    pub updates: ContextUpdate,
}

impl PhaseResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: Error) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_artifact(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.artifacts.insert(key.to_string(), value.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Collaborators shared by every phase of a run.
pub struct PhaseEnv {
    pub primary: SharedExecutor,
    pub debate: Option<Arc<DebateOrchestrator>>,
    pub vcs: Option<Arc<dyn VersionControl>>,
    pub runner: Arc<dyn CommandRunner>,
    pub commands: DetectedCommands,
    /// Identifiers from the known-failures file.
    pub known_failures: Vec<String>,
    pub base_branch: String,
    /// Rules written into the workspace at setup.
    pub rules: RulesConfig,
    pub events: EventSink,
}

impl PhaseEnv {
    pub fn new(primary: SharedExecutor) -> Self {
        Self {
            primary,
            debate: None,
            vcs: None,
            runner: Arc::new(ShellCommandRunner),
            commands: DetectedCommands::default(),
            known_failures: Vec::new(),
            base_branch: "main".to_string(),
            rules: RulesConfig::default(),
            events: EventSink::none(),
        }
    }

    pub fn with_debate(mut self, debate: Arc<DebateOrchestrator>) -> Self {
        self.debate = Some(debate);
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_commands(mut self, commands: DetectedCommands) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_known_failures(mut self, known: Vec<String>) -> Self {
        self.known_failures = known;
        self
    }

    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    pub fn with_rules(mut self, rules: RulesConfig) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Debate orchestrator for `phase`, if debate applies to it.
    pub fn debate_for(&self, def: &PhaseDefinition) -> Option<&DebateOrchestrator> {
        if !def.debate_capable {
            return None;
        }
        self.debate
            .as_deref()
            .filter(|d| d.config().applies_to(&def.name))
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Phase: Send + Sync {
    fn definition(&self) -> &PhaseDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    /// Runs the phase. The context is read-only; changes go in the result.
    ///
    /// `Err` means the phase failed before spending anything.
    async fn execute(&self, env: &PhaseEnv, ctx: &WorkflowContext) -> Result<PhaseResult>;
}

/// Builds the full catalogue with `config` applied.
pub fn catalogue(config: &WorkflowConfig) -> Vec<Box<dyn Phase>> {
    PhaseKind::all()
        .iter()
        .map(|kind| build_phase(*kind, kind.definition(config)))
        .collect()
}

fn build_phase(kind: PhaseKind, def: PhaseDefinition) -> Box<dyn Phase> {
    match kind {
        PhaseKind::Setup => Box::new(SetupPhase::new(def)),
        PhaseKind::TestExecution => Box::new(TestExecutionPhase::new(def)),
        PhaseKind::LintCheck => Box::new(LintPhase::new(def)),
        PhaseKind::FinalVerification => Box::new(FinalVerificationPhase::new(def)),
        PhaseKind::CommitPrep => Box::new(CommitPhase::new(def)),
        PhaseKind::ConflictCheck => Box::new(ConflictPhase::new(def)),
        PhaseKind::PrCreation => Box::new(PullRequestPhase::new(def)),
        agent_kind => Box::new(AgentPhase::new(agent_kind, def)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedExecutor;
    use crate::debate::DebateConfig;

    #[test]
    fn catalogue_is_in_fixed_order() {
        let names: Vec<_> = catalogue(&WorkflowConfig::default())
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names.len(), 15);
        assert_eq!(names.first().map(String::as_str), Some("setup"));
        assert_eq!(names[6], "test_execution");
        assert_eq!(names.last().map(String::as_str), Some("pr_creation"));
    }

    #[test]
    fn names_round_trip() {
        for kind in PhaseKind::all() {
            assert_eq!(PhaseKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(PhaseKind::from_name("deploy"), None);
    }

    #[test]
    fn default_definitions_follow_catalogue() {
        let planning = PhaseKind::Planning.default_definition();
        assert_eq!(planning.timeout, Duration::from_secs(600));
        assert_eq!(planning.estimated_cost, 1.0);
        assert!(planning.requires_approval);
        assert!(!planning.requires_write);
        assert!(planning.debate_capable);
        assert!(!planning.allowed_tools.contains(&"Write".to_string()));

        let tests = PhaseKind::TestExecution.default_definition();
        assert_eq!(tests.max_iterations, 5);
        assert!(tests.requires_write);
        assert!(!tests.requires_approval);

        assert!(PhaseKind::Research.default_definition().fresh_context);
        assert!(PhaseKind::TestWriting.default_definition().fresh_context);
        assert!(!PhaseKind::Implementation.default_definition().fresh_context);
        assert_eq!(PhaseKind::LintCheck.default_definition().max_iterations, 3);
    }

    #[test]
    fn config_overrides_and_gates_apply() {
        let config = WorkflowConfig::from_yaml(
            "approvals:\n  gates:\n    planning: false\n    code_review: true\n\
             phases:\n  implementation:\n    estimated_cost: 7.5\n    enabled: false\n",
        )
        .unwrap();

        assert!(!PhaseKind::Planning.definition(&config).requires_approval);
        assert!(PhaseKind::CodeReview.definition(&config).requires_approval);
        let implementation = PhaseKind::Implementation.definition(&config);
        assert_eq!(implementation.estimated_cost, 7.5);
        assert!(!implementation.enabled);
    }

    #[test]
    fn debate_applies_only_to_capable_enabled_phases() {
        let primary: SharedExecutor = Arc::new(ScriptedExecutor::new("claude"));
        let secondary: SharedExecutor = Arc::new(ScriptedExecutor::new("codex"));
        let config = DebateConfig {
            enabled: true,
            ..DebateConfig::default()
        };
        let env = PhaseEnv::new(primary.clone())
            .with_debate(Arc::new(DebateOrchestrator::new(primary, secondary, config)));

        assert!(env
            .debate_for(&PhaseKind::Planning.default_definition())
            .is_some());
        assert!(env
            .debate_for(&PhaseKind::Implementation.default_definition())
            .is_none());
        assert!(PhaseEnv::new(Arc::new(ScriptedExecutor::new("claude")))
            .debate_for(&PhaseKind::Planning.default_definition())
            .is_none());
    }
}
