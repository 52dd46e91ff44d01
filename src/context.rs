//! Workflow context: the unit of state for one pipeline run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fixloop::BaselineFailureSet;
use crate::ledger::CostLedger;

/// Artifacts produced by one phase, keyed by artifact name.
pub type PhaseArtifacts = BTreeMap<String, serde_json::Value>;

/// State of a single workflow run.
///
/// Owned by the sequencer. Phases read it and return a [`ContextUpdate`]
/// instead of mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Short task name, used in file and branch names.
    pub task_name: String,
    /// Full task description handed to agents.
    pub task_description: String,
    /// Repository the run operates on.
    pub repo_path: PathBuf,
    /// Directory for phase output files.
    pub artifacts_dir: PathBuf,
    /// Isolated workspace created by the setup phase.
    #[serde(default)]
    pub workspace_path: Option<PathBuf>,
    /// Branch checked out in the workspace.
    #[serde(default)]
    pub branch_name: Option<String>,
    /// URL of the opened change request.
    #[serde(default)]
    pub change_request_url: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Phase currently executing (or last visited).
    #[serde(default)]
    pub current_phase: Option<String>,
    /// Completed phases in completion order.
    #[serde(default)]
    pub completed_phases: Vec<String>,
    /// Budget and spend.
    pub ledger: CostLedger,
    /// Artifacts per phase.
    #[serde(default)]
    pub artifacts: BTreeMap<String, PhaseArtifacts>,
    /// Agent session ids per phase, for context continuation.
    #[serde(default)]
    pub session_ids: BTreeMap<String, String>,
    /// Phases removed from this run.
    #[serde(default)]
    pub disabled_phases: BTreeSet<String>,
    /// Phase to fast-forward to.
    #[serde(default)]
    pub skip_to: Option<String>,
    /// Phases passed over by a skip-to. They stay skipped on resume.
    #[serde(default)]
    pub skipped_phases: BTreeSet<String>,
    /// Checkpoint id once the first checkpoint was written.
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// Test failures present before any fix attempt.
    #[serde(default)]
    pub baseline: Option<BaselineFailureSet>,
    /// Non-fatal issues collected from phases.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl WorkflowContext {
    /// Creates a fresh context for a new run.
    pub fn new(
        task_name: impl Into<String>,
        task_description: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
        budget_limit: f64,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            task_description: task_description.into(),
            repo_path: repo_path.into(),
            artifacts_dir: artifacts_dir.into(),
            workspace_path: None,
            branch_name: None,
            change_request_url: None,
            started_at: Utc::now(),
            current_phase: None,
            completed_phases: Vec::new(),
            ledger: CostLedger::new(budget_limit),
            artifacts: BTreeMap::new(),
            session_ids: BTreeMap::new(),
            disabled_phases: BTreeSet::new(),
            skip_to: None,
            skipped_phases: BTreeSet::new(),
            checkpoint_id: None,
            baseline: None,
            warnings: Vec::new(),
        }
    }

    /// Disables the given phases.
    pub fn with_disabled_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled_phases
            .extend(phases.into_iter().map(Into::into));
        self
    }

    /// Sets the skip-to target.
    pub fn with_skip_to(mut self, phase: impl Into<String>) -> Self {
        self.skip_to = Some(phase.into());
        self
    }

    /// Directory agents and commands run in.
    pub fn working_dir(&self) -> &Path {
        self.workspace_path.as_deref().unwrap_or(&self.repo_path)
    }

    pub fn is_completed(&self, phase: &str) -> bool {
        self.completed_phases.iter().any(|p| p == phase)
    }

    pub fn is_disabled(&self, phase: &str) -> bool {
        self.disabled_phases.contains(phase)
    }

    pub fn is_skipped(&self, phase: &str) -> bool {
        self.skipped_phases.contains(phase)
    }

    /// Appends a phase to the completed list once.
    pub fn mark_phase_complete(&mut self, phase: &str) {
        self.skipped_phases.remove(phase);
        if !self.is_completed(phase) {
            self.completed_phases.push(phase.to_string());
        }
    }

    /// Replaces the artifacts stored for a phase.
    pub fn record_artifacts(&mut self, phase: &str, artifacts: PhaseArtifacts) {
        self.artifacts.insert(phase.to_string(), artifacts);
    }

    pub fn artifact(&self, phase: &str, key: &str) -> Option<&serde_json::Value> {
        self.artifacts.get(phase).and_then(|a| a.get(key))
    }

    /// Reads a path-valued artifact, ignoring it if the file is gone.
    pub fn artifact_file(&self, phase: &str, key: &str) -> Option<PathBuf> {
        self.artifact(phase, key)
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .filter(|p| p.exists())
    }

    /// Most recent session id from the latest completed phase that has one.
    pub fn latest_session_id(&self) -> Option<&str> {
        self.completed_phases
            .iter()
            .rev()
            .find_map(|p| self.session_ids.get(p))
            .map(String::as_str)
    }

    /// Folds a phase's context update into the context.
    pub fn apply(&mut self, update: ContextUpdate) {
        if let Some(path) = update.workspace_path {
            self.workspace_path = Some(path);
        }
        if let Some(branch) = update.branch_name {
            self.branch_name = Some(branch);
        }
        if let Some(url) = update.change_request_url {
            self.change_request_url = Some(url);
        }
        // Once captured, the baseline is immutable for the run.
        if self.baseline.is_none() {
            self.baseline = update.baseline;
        }
    }
}

/// Changes to non-artifact context fields requested by a phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub workspace_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub change_request_url: Option<String>,
    pub baseline: Option<BaselineFailureSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkflowContext {
        WorkflowContext::new("add-cache", "Add a cache", "/repo", "/repo/plans", 10.0)
    }

    #[test]
    fn working_dir_prefers_workspace() {
        let mut ctx = context();
        assert_eq!(ctx.working_dir(), Path::new("/repo"));

        ctx.apply(ContextUpdate {
            workspace_path: Some("/tmp/ws".into()),
            branch_name: Some("assembly/add-cache".into()),
            ..Default::default()
        });
        assert_eq!(ctx.working_dir(), Path::new("/tmp/ws"));
        assert_eq!(ctx.branch_name.as_deref(), Some("assembly/add-cache"));
    }

    #[test]
    fn mark_phase_complete_is_append_only_and_unique() {
        let mut ctx = context();
        ctx.mark_phase_complete("research");
        ctx.mark_phase_complete("planning");
        ctx.mark_phase_complete("research");
        assert_eq!(ctx.completed_phases, vec!["research", "planning"]);
    }

    #[test]
    fn latest_session_follows_completion_order() {
        let mut ctx = context();
        ctx.mark_phase_complete("research");
        ctx.session_ids.insert("research".into(), "s1".into());
        ctx.mark_phase_complete("planning");
        assert_eq!(ctx.latest_session_id(), Some("s1"));

        ctx.session_ids.insert("planning".into(), "s2".into());
        assert_eq!(ctx.latest_session_id(), Some("s2"));
    }

    #[test]
    fn baseline_is_not_replaced_once_captured() {
        let mut ctx = context();
        let first = BaselineFailureSet::new(vec!["a".into()], vec![]);
        ctx.apply(ContextUpdate {
            baseline: Some(first.clone()),
            ..Default::default()
        });
        ctx.apply(ContextUpdate {
            baseline: Some(BaselineFailureSet::new(vec!["b".into()], vec![])),
            ..Default::default()
        });
        assert_eq!(ctx.baseline, Some(first));
    }

    #[test]
    fn artifact_file_ignores_missing_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plan.md");
        std::fs::write(&file, "plan").unwrap();

        let mut ctx = context();
        let mut artifacts = PhaseArtifacts::new();
        artifacts.insert("output_file".into(), file.to_string_lossy().into());
        artifacts.insert("missing".into(), "/nonexistent/file.md".into());
        ctx.record_artifacts("planning", artifacts);

        assert_eq!(ctx.artifact_file("planning", "output_file"), Some(file));
        assert_eq!(ctx.artifact_file("planning", "missing"), None);
        assert_eq!(ctx.artifact_file("research", "output_file"), None);
    }
}
