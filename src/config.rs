//! Workflow configuration and validation.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! runnable configuration. Files are YAML or TOML, chosen by extension.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;
use crate::commands::DetectedCommands;
use crate::debate::DebateConfig;
use crate::error::{Error, Result};
use crate::phases::PhaseKind;

/// File names looked up in the repository root, in order.
pub const CONFIG_FILE_NAMES: &[&str] = &[
    ".assembly-line.yaml",
    ".assembly-line.yml",
    ".assembly-line.toml",
];

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Agent backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub primary: AgentKind,
    /// Reviewer / second debater.
    #[serde(default = "default_secondary")]
    pub secondary: AgentKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub claude_path: Option<String>,
    #[serde(default)]
    pub codex_path: Option<String>,
}

fn default_secondary() -> AgentKind {
    AgentKind::Codex
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            primary: AgentKind::Claude,
            secondary: default_secondary(),
            model: None,
            claude_path: None,
            codex_path: None,
        }
    }
}

impl AgentConfig {
    /// CLI path configured for `kind`, if any.
    pub fn cli_path(&self, kind: AgentKind) -> Option<&str> {
        match kind {
            AgentKind::Claude => self.claude_path.as_deref(),
            AgentKind::Codex => self.codex_path.as_deref(),
        }
    }
}

/// Human approval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    /// Per-phase approval requirement. Phases not listed keep their default.
    #[serde(default = "default_gates")]
    pub gates: BTreeMap<String, bool>,
    #[serde(default = "default_poll_initial")]
    pub poll_initial_secs: u64,
    #[serde(default = "default_poll_max")]
    pub poll_max_secs: u64,
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff: f64,
}

fn default_timeout_hours() -> f64 {
    24.0
}

fn default_gates() -> BTreeMap<String, bool> {
    BTreeMap::from([("planning".to_string(), true)])
}

fn default_poll_initial() -> u64 {
    10
}

fn default_poll_max() -> u64 {
    60
}

fn default_poll_backoff() -> f64 {
    1.5
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_hours: default_timeout_hours(),
            gates: default_gates(),
            poll_initial_secs: default_poll_initial(),
            poll_max_secs: default_poll_max(),
            poll_backoff: default_poll_backoff(),
        }
    }
}

impl ApprovalsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_hours.max(0.0) * 3600.0)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_secs(self.poll_initial_secs)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_secs(self.poll_max_secs)
    }
}

/// Per-phase overrides of the catalogue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

/// Where state and artifacts live.
///
/// Relative paths resolve against the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPaths {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_known_failures")]
    pub known_failures_file: PathBuf,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Directory holding isolated workspaces. Defaults to the system temp dir.
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".assembly-line")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("plans")
}

fn default_known_failures() -> PathBuf {
    PathBuf::from(".known-failures")
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for WorkflowPaths {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            artifacts_dir: default_artifacts_dir(),
            known_failures_file: default_known_failures(),
            base_branch: default_base_branch(),
            worktree_base: None,
        }
    }
}

impl WorkflowPaths {
    pub fn checkpoints_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.state_dir).join("checkpoints")
    }

    pub fn approvals_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.state_dir).join("approvals")
    }

    pub fn artifacts_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.artifacts_dir)
    }

    pub fn known_failures_path(&self, repo: &Path) -> PathBuf {
        repo.join(&self.known_failures_file)
    }
}

/// Built-in project rules: (id, description).
pub const BUILTIN_RULES: &[(&str, &str)] = &[
    (
        "no-signature",
        "Do not add Co-Authored-By, signature lines, or AI attribution to commits, PRs, or code comments",
    ),
    ("no-emojis", "Do not use emojis in code, commits, or documentation"),
    (
        "no-yapping",
        "Be concise, avoid excessive explanations or verbose output",
    ),
];

/// File the rules are written to in a new workspace.
pub const RULES_FILE_NAME: &str = "CLAUDE.md";

/// Project rules written into every new workspace for the agent to follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Ids from the built-in rule set.
    #[serde(default = "default_enabled_rules")]
    pub enabled_rules: Vec<String>,
    /// Free-form rules, appended after the built-in ones.
    #[serde(default)]
    pub custom_rules: Vec<String>,
}

fn default_enabled_rules() -> Vec<String> {
    vec!["no-signature".to_string()]
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled_rules: default_enabled_rules(),
            custom_rules: Vec::new(),
        }
    }
}

impl RulesConfig {
    /// Active rules as (id, description). Unknown built-in ids are dropped;
    /// custom rules get ids `custom-1`, `custom-2`, ...
    pub fn active_rules(&self) -> Vec<(String, String)> {
        let builtin = self.enabled_rules.iter().filter_map(|id| {
            BUILTIN_RULES
                .iter()
                .find(|(known, _)| known == id)
                .map(|(id, desc)| (id.to_string(), desc.to_string()))
        });
        let custom = self
            .custom_rules
            .iter()
            .enumerate()
            .map(|(i, desc)| (format!("custom-{}", i + 1), desc.clone()));
        builtin.chain(custom).collect()
    }

    /// Markdown for the rules file, empty when no rule is active.
    pub fn render_markdown(&self) -> String {
        let rules = self.active_rules();
        if rules.is_empty() {
            return String::new();
        }
        let mut out = String::from("# Project Rules\n\nThe following rules MUST be followed:\n\n");
        for (_, description) in rules {
            out.push_str(&format!("- {}\n", description));
        }
        out
    }

    /// Writes the rules file into `workspace`. Returns the ids written, or
    /// an empty list if there was nothing to write.
    pub fn write_to(&self, workspace: &Path) -> Result<Vec<String>> {
        let content = self.render_markdown();
        if content.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::write(workspace.join(RULES_FILE_NAME), content)?;
        let ids: Vec<String> = self.active_rules().into_iter().map(|(id, _)| id).collect();
        tracing::info!(workspace = ?workspace, rules = ?ids, "project rules written");
        Ok(ids)
    }
}

impl Validate for RulesConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        for id in &self.enabled_rules {
            if !BUILTIN_RULES.iter().any(|(known, _)| known == id) {
                result.add_warning(format!("unknown rule '{}' in rules.enabled_rules", id));
            }
        }
        if self.custom_rules.iter().any(|r| r.trim().is_empty()) {
            result.add_warning("rules.custom_rules contains an empty rule");
        }
        result
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Spend limit for one run, in USD.
    #[serde(default = "default_budget_limit")]
    pub budget_limit: f64,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub debate: DebateConfig,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
    /// Overrides for detected project commands.
    #[serde(default)]
    pub commands: DetectedCommands,
    #[serde(default)]
    pub workflow: WorkflowPaths,
    #[serde(default)]
    pub rules: RulesConfig,
}

fn default_budget_limit() -> f64 {
    15.0
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            budget_limit: default_budget_limit(),
            agent: AgentConfig::default(),
            approvals: ApprovalsConfig::default(),
            debate: DebateConfig::default(),
            phases: BTreeMap::new(),
            commands: DetectedCommands::default(),
            workflow: WorkflowPaths::default(),
            rules: RulesConfig::default(),
        }
    }
}

impl WorkflowConfig {
    /// Loads a configuration file. The format follows the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            other => Err(Error::Config(format!(
                "unsupported config format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Loads the first config file found in `repo`, or defaults.
    pub fn discover(repo: &Path) -> Result<Self> {
        for name in CONFIG_FILE_NAMES {
            let path = repo.join(name);
            if path.is_file() {
                tracing::debug!(path = %path.display(), "loading config");
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn phase_override(&self, phase: &str) -> Option<&PhaseOverride> {
        self.phases.get(phase)
    }
}

impl Validate for WorkflowConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.budget_limit.is_nan() || self.budget_limit <= 0.0 {
            result.add_error("budget_limit must be positive");
        }

        for (name, phase) in &self.phases {
            if PhaseKind::from_name(name).is_none() {
                result.add_error(format!("unknown phase '{}' in phases", name));
            }
            if phase.timeout_secs == Some(0) {
                result.add_error(format!("phases.{}.timeout_secs must be at least 1", name));
            }
            if phase.estimated_cost.is_some_and(|c| c < 0.0 || !c.is_finite()) {
                result.add_error(format!("phases.{}.estimated_cost must be non-negative", name));
            }
            if phase.max_iterations == Some(0) {
                result.add_warning(format!(
                    "phases.{}.max_iterations = 0 means no fix attempts",
                    name
                ));
            }
        }

        result.merge(self.approvals.validate());
        result.merge(self.debate.validate());
        result.merge(self.rules.validate());

        if self.debate.enabled && self.agent.primary == self.agent.secondary {
            result.add_warning(
                "primary and secondary agents are the same - this may limit debate value",
            );
        }

        result
    }
}

impl Validate for ApprovalsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        for name in self.gates.keys() {
            if PhaseKind::from_name(name).is_none() {
                result.add_error(format!("unknown phase '{}' in approvals.gates", name));
            }
        }

        if self.timeout_hours.is_nan() || self.timeout_hours <= 0.0 {
            result.add_error("approvals.timeout_hours must be positive");
        }

        if self.poll_initial_secs == 0 {
            result.add_error("approvals.poll_initial_secs must be at least 1");
        }

        if self.poll_backoff < 1.0 {
            result.add_error("approvals.poll_backoff must be at least 1.0");
        }

        if self.poll_max_secs < self.poll_initial_secs {
            result.add_warning("approvals.poll_max_secs is below poll_initial_secs");
        }

        result
    }
}

impl Validate for DebateConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.turn_timeout_secs == 0 {
            result.add_error("debate.turn_timeout_secs must be at least 1");
        }

        if self.message_timeout_secs == 0 {
            result.add_error("debate.message_timeout_secs must be at least 1");
        }

        if self.message_timeout_secs > self.turn_timeout_secs {
            result.add_warning("debate.message_timeout_secs exceeds turn_timeout_secs");
        }

        if self.intensity.message_count() % 2 == 0 {
            result.add_error("debate exchange must have an odd number of messages");
        }

        if self.debate_subdir.trim().is_empty() {
            result.add_error("debate.debate_subdir cannot be empty");
        }

        result
    }
}
