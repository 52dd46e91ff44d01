//! Durable, versioned snapshots of workflow state.
//!
//! Layout: `<dir>/<checkpoint_id>/<version>.json`. Every save writes a new
//! version through a temp file and a rename, so readers only ever observe
//! complete snapshots. `load` returns the highest version.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::WorkflowContext;
use crate::error::{Error, Result};

/// Lifecycle status recorded with each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    PausedForApproval,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::PausedForApproval => "paused-for-approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a run halted, with enough context to decide how to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: String,
    /// Stable error kind, see [`Error::kind`].
    pub kind: String,
    pub message: String,
    pub spent: f64,
    pub remaining: f64,
}

impl FailureRecord {
    pub fn from_error(phase: &str, error: &Error, ctx: &WorkflowContext) -> Self {
        Self {
            phase: phase.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            spent: ctx.ledger.spent_total(),
            remaining: ctx.ledger.remaining(),
        }
    }
}

/// Status markers saved alongside a context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointMarkers {
    pub status: RunStatus,
    /// Phase waiting on an approval grant.
    pub pending_approval: Option<String>,
    pub failure: Option<FailureRecord>,
}

/// One immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Next phase to run, `None` once the run has nothing left.
    pub next_phase: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub pending_approval: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    pub context: WorkflowContext,
}

/// Listing entry for a checkpoint id.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub id: String,
    pub task_name: String,
    pub next_phase: Option<String>,
    pub status: RunStatus,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Derives the opaque checkpoint id from task name and start time.
pub fn checkpoint_id(task_name: &str, started_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}", task_name, started_at.to_rfc3339()).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("checkpoint_{}", hex)
}

/// Handle to a checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Id a context is (or will be) saved under.
    pub fn id_for(ctx: &WorkflowContext) -> String {
        ctx.checkpoint_id
            .clone()
            .unwrap_or_else(|| checkpoint_id(&ctx.task_name, &ctx.started_at))
    }

    /// Saves a running-state checkpoint.
    pub fn save(&self, ctx: &WorkflowContext, next_phase: Option<&str>) -> Result<String> {
        self.save_with(ctx, next_phase, CheckpointMarkers::default())
    }

    /// Saves a checkpoint with explicit status markers and returns its id.
    pub fn save_with(
        &self,
        ctx: &WorkflowContext,
        next_phase: Option<&str>,
        markers: CheckpointMarkers,
    ) -> Result<String> {
        let id = Self::id_for(ctx);
        let run_dir = self.dir.join(&id);
        fs::create_dir_all(&run_dir)?;

        let version = latest_version(&run_dir)?.map_or(1, |v| v + 1);

        let mut context = ctx.clone();
        context.checkpoint_id = Some(id.clone());

        let checkpoint = Checkpoint {
            id: id.clone(),
            version,
            created_at: Utc::now(),
            next_phase: next_phase.map(str::to_string),
            status: markers.status,
            pending_approval: markers.pending_approval,
            failure: markers.failure,
            context,
        };

        let contents = serde_json::to_string_pretty(&checkpoint)?;
        let path = run_dir.join(version_file_name(version));
        let tmp_path = run_dir.join(format!(".{}.{}.tmp", version, uuid::Uuid::new_v4()));
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &path)?;

        tracing::info!(
            checkpoint = %id,
            version,
            next_phase = ?checkpoint.next_phase,
            status = %checkpoint.status,
            "checkpoint saved"
        );
        Ok(id)
    }

    /// Loads the most recent version of a checkpoint.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::CheckpointNotFound(id.to_string()));
        }
        let run_dir = self.dir.join(id);
        if !run_dir.is_dir() {
            return Err(Error::CheckpointNotFound(id.to_string()));
        }

        let version = latest_version(&run_dir)
            .map_err(|e| Error::CorruptCheckpoint {
                id: id.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?;

        let path = run_dir.join(version_file_name(version));
        let contents = fs::read_to_string(&path).map_err(|e| Error::CorruptCheckpoint {
            id: id.to_string(),
            reason: format!("unreadable {}: {}", path.display(), e),
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&contents).map_err(|e| Error::CorruptCheckpoint {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if checkpoint.id != id {
            return Err(Error::CorruptCheckpoint {
                id: id.to_string(),
                reason: format!("snapshot belongs to {}", checkpoint.id),
            });
        }
        Ok(checkpoint)
    }

    /// Loads a checkpoint and returns a fresh context rebuilt from it.
    pub fn load_context(&self, id: &str) -> Result<WorkflowContext> {
        Ok(self.load(id)?.context)
    }

    /// Summaries of every checkpoint, most recent first.
    ///
    /// Unreadable checkpoints are skipped with a warning.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load(&id) {
                Ok(cp) => summaries.push(CheckpointSummary {
                    id: cp.id,
                    task_name: cp.context.task_name.clone(),
                    next_phase: cp.next_phase,
                    status: cp.status,
                    cost: cp.context.ledger.spent_total(),
                    created_at: cp.created_at,
                }),
                Err(e) => tracing::warn!(checkpoint = %id, error = %e, "skipping unreadable checkpoint"),
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

fn version_file_name(version: u32) -> String {
    format!("{:06}.json", version)
}

/// Highest complete version in a run directory. Temp files are ignored.
fn latest_version(run_dir: &Path) -> Result<Option<u32>> {
    let mut latest = None;
    for entry in fs::read_dir(run_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        if let Ok(version) = stem.parse::<u32>() {
            latest = latest.max(Some(version));
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PhaseArtifacts;
    use tempfile::TempDir;

    fn context() -> WorkflowContext {
        WorkflowContext::new("add-cache", "Add a cache layer", "/repo", "/repo/plans", 5.0)
    }

    #[test]
    fn checkpoint_id_is_stable_and_prefixed() {
        let ctx = context();
        let a = checkpoint_id(&ctx.task_name, &ctx.started_at);
        let b = checkpoint_id(&ctx.task_name, &ctx.started_at);
        assert_eq!(a, b);
        assert!(a.starts_with("checkpoint_"));
        assert_eq!(a.len(), "checkpoint_".len() + 8);
    }

    #[test]
    fn round_trip_with_empty_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ctx = context();

        let id = store.save(&ctx, Some("research")).unwrap();
        let cp = store.load(&id).unwrap();

        let mut expected = ctx.clone();
        expected.checkpoint_id = Some(id.clone());
        assert_eq!(cp.context, expected);
        assert_eq!(cp.next_phase.as_deref(), Some("research"));
        assert_eq!(cp.status, RunStatus::Running);
    }

    #[test]
    fn round_trip_with_costs_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut ctx = context();
        ctx.ledger.add_cost("research", 0.37).unwrap();
        ctx.ledger.add_cost("planning", 1.1).unwrap();
        ctx.mark_phase_complete("research");
        ctx.mark_phase_complete("planning");
        let mut artifacts = PhaseArtifacts::new();
        artifacts.insert("output_file".into(), "/repo/plans/plan-add-cache.md".into());
        artifacts.insert("messages".into(), serde_json::json!([1, 2, 3]));
        ctx.record_artifacts("planning", artifacts);
        ctx.session_ids.insert("planning".into(), "sess-1".into());
        ctx.checkpoint_id = Some(CheckpointStore::id_for(&ctx));

        let id = store.save(&ctx, Some("plan_review")).unwrap();
        assert_eq!(store.load_context(&id).unwrap(), ctx);
    }

    #[test]
    fn load_returns_latest_version() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut ctx = context();

        let id = store.save(&ctx, Some("research")).unwrap();
        ctx.mark_phase_complete("research");
        store.save(&ctx, Some("planning")).unwrap();

        let cp = store.load(&id).unwrap();
        assert_eq!(cp.version, 2);
        assert_eq!(cp.next_phase.as_deref(), Some("planning"));
        assert_eq!(cp.context.completed_phases, vec!["research"]);
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("checkpoint_deadbeef"),
            Err(Error::CheckpointNotFound(_))
        ));
        assert!(matches!(
            store.load("../escape"),
            Err(Error::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn invalid_json_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let run_dir = dir.path().join("checkpoint_00000000");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("000001.json"), "{\"id\": \"checkpoint_0").unwrap();

        assert!(matches!(
            store.load("checkpoint_00000000"),
            Err(Error::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn leftover_temp_files_are_invisible() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ctx = context();
        let id = store.save(&ctx, Some("research")).unwrap();

        // A crash mid-write leaves only a temp file behind.
        fs::write(dir.path().join(&id).join(".2.partial.tmp"), "{").unwrap();

        let cp = store.load(&id).unwrap();
        assert_eq!(cp.version, 1);
    }

    #[test]
    fn failure_markers_are_persisted() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ctx = context();
        let err = Error::InsufficientBudget {
            phase: "planning".into(),
            remaining: 0.5,
            estimated: 1.0,
        };
        let id = store
            .save_with(
                &ctx,
                Some("planning"),
                CheckpointMarkers {
                    status: RunStatus::Failed,
                    pending_approval: None,
                    failure: Some(FailureRecord::from_error("planning", &err, &ctx)),
                },
            )
            .unwrap();

        let cp = store.load(&id).unwrap();
        assert_eq!(cp.status, RunStatus::Failed);
        let failure = cp.failure.unwrap();
        assert_eq!(failure.kind, "insufficient_budget");
        assert_eq!(failure.remaining, 5.0);
    }

    #[test]
    fn list_is_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());

        let first = context();
        store.save(&first, Some("research")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        let mut second =
            WorkflowContext::new("fix-bug", "Fix the bug", "/repo", "/repo/plans", 5.0);
        second.ledger.add_cost("research", 0.5).unwrap();
        store.save(&second, Some("planning")).unwrap();

        // Corrupt entries are skipped, not fatal.
        fs::create_dir_all(dir.path().join("checkpoint_broken")).unwrap();
        fs::write(dir.path().join("checkpoint_broken/000001.json"), "nope").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].task_name, "fix-bug");
        assert_eq!(list[0].cost, 0.5);
        assert_eq!(list[1].task_name, "add-cache");
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let store = CheckpointStore::new("/nonexistent/checkpoints");
        assert!(store.list().unwrap().is_empty());
    }
}
