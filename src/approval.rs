//! Approval records and the gate that waits on them.
//!
//! Grants are plain files under `<dir>/<task>/<phase>.approved`, so a later,
//! separate invocation of the tool can grant an approval that a running
//! workflow then observes by polling.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ApprovalsConfig;
use crate::error::{Error, Result};
use crate::phases::PhaseDefinition;

const RECORD_EXTENSION: &str = "approved";

/// A persisted grant for one (task, phase) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub task_name: String,
    pub phase: String,
    pub granted_at: DateTime<Utc>,
}

/// Durable store of approval grants.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    dir: PathBuf,
}

impl ApprovalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_dir(&self, task_name: &str) -> PathBuf {
        self.dir.join(sanitize(task_name))
    }

    fn record_path(&self, task_name: &str, phase: &str) -> PathBuf {
        self.task_dir(task_name)
            .join(format!("{}.{}", sanitize(phase), RECORD_EXTENSION))
    }

    /// Grants approval for a phase. Granting twice refreshes the timestamp.
    pub fn grant(&self, task_name: &str, phase: &str) -> Result<ApprovalRecord> {
        let record = ApprovalRecord {
            task_name: task_name.to_string(),
            phase: phase.to_string(),
            granted_at: Utc::now(),
        };

        let path = self.record_path(task_name, phase);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));
        fs::write(&tmp_path, serde_json::to_string_pretty(&record)?)?;
        fs::rename(&tmp_path, &path)?;

        tracing::info!(task = %task_name, phase = %phase, "approval granted");
        Ok(record)
    }

    /// Removes a grant. Returns false if there was none.
    pub fn revoke(&self, task_name: &str, phase: &str) -> Result<bool> {
        let path = self.record_path(task_name, phase);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(task = %task_name, phase = %phase, "approval revoked");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a readable grant exists. Reading never consumes it.
    pub fn is_granted(&self, task_name: &str, phase: &str) -> bool {
        let path = self.record_path(task_name, phase);
        path.is_file() && read_record(&path).is_some()
    }

    /// All grants recorded for a task, ordered by phase name.
    pub fn list(&self, task_name: &str) -> Result<Vec<ApprovalRecord>> {
        let dir = self.task_dir(task_name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(record) = read_record(&path) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.phase.cmp(&b.phase));
        Ok(records)
    }
}

/// Parses a grant file. Unreadable records count as absent.
fn read_record(path: &Path) -> Option<ApprovalRecord> {
    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|contents| {
            serde_json::from_str::<ApprovalRecord>(&contents).map_err(|e| e.to_string())
        });
    match parsed {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "ignoring unreadable approval record");
            None
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Blocks a gated phase until its approval record appears or time runs out.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    store: ApprovalStore,
    enabled: bool,
    timeout: Duration,
    poll_initial: Duration,
    poll_max: Duration,
    poll_backoff: f64,
}

impl ApprovalGate {
    pub fn new(store: ApprovalStore, config: &ApprovalsConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            timeout: config.timeout(),
            poll_initial: config.poll_initial(),
            poll_max: config.poll_max(),
            poll_backoff: config.poll_backoff,
        }
    }

    /// Turns the gate on or off regardless of configuration.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn store(&self) -> &ApprovalStore {
        &self.store
    }

    /// Configured wait timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the sequencer must wait for this phase.
    pub fn is_required(&self, phase: &PhaseDefinition) -> bool {
        self.enabled && phase.requires_approval
    }

    /// Calculates the next poll interval using exponential backoff.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.poll_backoff);
        next.min(self.poll_max)
    }

    /// Waits for a grant on `phase`, polling the record store.
    ///
    /// A grant written before the call is honored immediately.
    pub async fn wait(&self, task_name: &str, phase: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut interval = self.poll_initial;

        tracing::info!(
            task = %task_name,
            phase = %phase,
            timeout_hours = timeout.as_secs_f64() / 3600.0,
            "waiting for approval"
        );

        loop {
            if self.store.is_granted(task_name, phase) {
                tracing::info!(phase = %phase, waited = ?start.elapsed(), "approval found");
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::ApprovalTimeout {
                    phase: phase.to_string(),
                    elapsed_hours: elapsed.as_secs_f64() / 3600.0,
                });
            }

            tracing::debug!(phase = %phase, next_poll = ?interval, "approval not yet granted");
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
            interval = self.next_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::PhaseKind;
    use tempfile::TempDir;

    fn gate(dir: &Path) -> ApprovalGate {
        let config = ApprovalsConfig {
            enabled: true,
            ..ApprovalsConfig::default()
        };
        ApprovalGate::new(ApprovalStore::new(dir), &config)
    }

    fn hours(h: f64) -> Duration {
        Duration::from_secs_f64(h * 3600.0)
    }

    #[test]
    fn grant_revoke_and_list() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());

        assert!(!store.is_granted("add-cache", "planning"));
        store.grant("add-cache", "planning").unwrap();
        store.grant("add-cache", "code_review").unwrap();
        assert!(store.is_granted("add-cache", "planning"));
        assert!(!store.is_granted("other-task", "planning"));

        let phases: Vec<_> = store
            .list("add-cache")
            .unwrap()
            .into_iter()
            .map(|r| r.phase)
            .collect();
        assert_eq!(phases, vec!["code_review", "planning"]);

        assert!(store.revoke("add-cache", "planning").unwrap());
        assert!(!store.revoke("add-cache", "planning").unwrap());
        assert!(!store.is_granted("add-cache", "planning"));
    }

    #[test]
    fn unreadable_record_is_not_a_grant() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path());
        store.grant("add-cache", "code_review").unwrap();

        let path = store.record_path("add-cache", "planning");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        assert!(!store.is_granted("add-cache", "planning"));
        let phases: Vec<_> = store
            .list("add-cache")
            .unwrap()
            .into_iter()
            .map(|r| r.phase)
            .collect();
        assert_eq!(phases, vec!["code_review"]);

        store.grant("add-cache", "planning").unwrap();
        assert!(store.is_granted("add-cache", "planning"));
    }

    #[test]
    fn task_names_cannot_escape_store() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::new(dir.path().join("approvals"));
        store.grant("../evil", "planning").unwrap();
        assert!(dir.path().join("approvals/---evil/planning.approved").is_file());
    }

    #[test]
    fn is_required_needs_global_flag_and_phase_flag() {
        let dir = TempDir::new().unwrap();
        let planning = PhaseKind::Planning.default_definition();
        let research = PhaseKind::Research.default_definition();

        let enabled = gate(dir.path());
        assert!(enabled.is_required(&planning));
        assert!(!enabled.is_required(&research));

        let disabled = gate(dir.path()).with_enabled(false);
        assert!(!disabled.is_required(&planning));
    }

    #[test]
    fn next_interval_applies_backoff_and_cap() {
        let dir = TempDir::new().unwrap();
        let gate = gate(dir.path());
        assert_eq!(
            gate.next_interval(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
        assert_eq!(
            gate.next_interval(Duration::from_secs(100)),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_grant() {
        let dir = TempDir::new().unwrap();
        let gate = gate(dir.path());

        let start = Instant::now();
        let err = gate
            .wait("add-cache", "planning", hours(0.01))
            .await
            .unwrap_err();

        match err {
            Error::ApprovalTimeout {
                phase,
                elapsed_hours,
            } => {
                assert_eq!(phase, "planning");
                assert!(elapsed_hours >= 0.01);
                assert!(elapsed_hours < 0.011);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() <= hours(0.01) + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_honors_grant_made_before_waiting() {
        let dir = TempDir::new().unwrap();
        let gate = gate(dir.path());
        gate.store().grant("add-cache", "planning").unwrap();

        tokio_test::assert_ok!(gate.wait("add-cache", "planning", hours(0.01)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_grant_made_during_wait() {
        let dir = TempDir::new().unwrap();
        let gate = gate(dir.path());
        let store = gate.store().clone();

        let granter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            store.grant("add-cache", "planning").unwrap();
        });

        tokio_test::assert_ok!(gate.wait("add-cache", "planning", hours(0.01)).await);
        granter.await.unwrap();
    }
}
