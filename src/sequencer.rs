//! Phase sequencer.
//!
//! Walks the phase list in order. For each eligible phase it checks the
//! budget, waits for approval where required, executes the phase, charges
//! its cost and checkpoints the context. Any failure halts the run with a
//! failed checkpoint; nothing is retried at this level.

use std::path::Path;
use std::sync::Arc;

use crate::agent::SharedExecutor;
use crate::approval::{ApprovalGate, ApprovalStore};
use crate::checkpoint::{CheckpointMarkers, CheckpointStore, FailureRecord, RunStatus};
use crate::commands;
use crate::config::WorkflowConfig;
use crate::context::WorkflowContext;
use crate::debate::DebateOrchestrator;
use crate::error::{Error, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::fixloop::load_known_failures;
use crate::phases::{catalogue, Phase, PhaseDefinition, PhaseEnv, PhaseResult};
use crate::vcs::GitVcs;

/// Why a phase will or will not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Run,
    Disabled,
    Completed,
    /// Before the skip-to target.
    Skipped,
}

impl Eligibility {
    fn reason(&self) -> &'static str {
        match self {
            Eligibility::Run => "eligible",
            Eligibility::Disabled => "disabled",
            Eligibility::Completed => "already completed",
            Eligibility::Skipped => "before skip-to target",
        }
    }
}

/// A phase and whether it will run, for dry runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPhase {
    pub name: String,
    pub estimated_cost: f64,
    pub requires_approval: bool,
    pub eligibility: Eligibility,
}

/// Drives a workflow context through the phase list.
pub struct Orchestrator {
    phases: Vec<Box<dyn Phase>>,
    env: PhaseEnv,
    checkpoints: CheckpointStore,
    gate: ApprovalGate,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(
        phases: Vec<Box<dyn Phase>>,
        env: PhaseEnv,
        checkpoints: CheckpointStore,
        gate: ApprovalGate,
    ) -> Self {
        Self {
            phases,
            env,
            checkpoints,
            gate,
            events: EventSink::none(),
        }
    }

    /// Wires the full phase catalogue for `repo` from configuration.
    pub fn from_config(
        config: &WorkflowConfig,
        repo: &Path,
        primary: SharedExecutor,
        secondary: SharedExecutor,
        events: EventSink,
    ) -> Self {
        let paths = &config.workflow;

        let mut vcs = GitVcs::new(repo);
        if let Some(base) = &paths.worktree_base {
            vcs = vcs.with_worktree_base(repo.join(base));
        }

        let mut env = PhaseEnv::new(primary.clone())
            .with_vcs(Arc::new(vcs))
            .with_commands(commands::detect(repo).with_overrides(&config.commands))
            .with_known_failures(load_known_failures(&paths.known_failures_path(repo)))
            .with_base_branch(paths.base_branch.clone())
            .with_rules(config.rules.clone())
            .with_events(events.clone());
        if config.debate.enabled {
            let debate = DebateOrchestrator::new(primary, secondary, config.debate.clone())
                .with_events(events.clone());
            env = env.with_debate(Arc::new(debate));
        }

        let gate = ApprovalGate::new(
            ApprovalStore::new(paths.approvals_dir(repo)),
            &config.approvals,
        );
        Self::new(
            catalogue(config),
            env,
            CheckpointStore::new(paths.checkpoints_dir(repo)),
            gate,
        )
        .with_events(events)
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn definitions(&self) -> impl Iterator<Item = &PhaseDefinition> {
        self.phases.iter().map(|p| p.definition())
    }

    /// Loads the context of the latest checkpoint for `id`.
    pub fn resume(&self, id: &str) -> Result<WorkflowContext> {
        let checkpoint = self.checkpoints.load(id)?;
        tracing::info!(
            checkpoint = %id,
            status = %checkpoint.status,
            next_phase = ?checkpoint.next_phase,
            completed = checkpoint.context.completed_phases.len(),
            spent = checkpoint.context.ledger.spent_total(),
            "resuming workflow"
        );
        Ok(checkpoint.context)
    }

    /// Decides, for every phase, whether it runs in `ctx`.
    ///
    /// From the skip-to target onwards, completed phases run again. Phases a
    /// previous skip-to passed over stay skipped.
    pub fn plan(&self, ctx: &WorkflowContext) -> Result<Vec<PlannedPhase>> {
        let target = self.skip_target(ctx)?;

        Ok(self
            .phases
            .iter()
            .enumerate()
            .map(|(i, phase)| {
                let def = phase.definition();
                let eligibility = if !def.enabled || ctx.is_disabled(&def.name) {
                    Eligibility::Disabled
                } else if target.is_some_and(|t| i < t) {
                    Eligibility::Skipped
                } else if target.is_none() && ctx.is_completed(&def.name) {
                    Eligibility::Completed
                } else if target.is_none() && ctx.is_skipped(&def.name) {
                    Eligibility::Skipped
                } else {
                    Eligibility::Run
                };
                PlannedPhase {
                    name: def.name.clone(),
                    estimated_cost: def.estimated_cost,
                    requires_approval: self.gate.is_required(def),
                    eligibility,
                }
            })
            .collect())
    }

    fn skip_target(&self, ctx: &WorkflowContext) -> Result<Option<usize>> {
        match &ctx.skip_to {
            Some(target) => self
                .phases
                .iter()
                .position(|p| p.name() == target)
                .map(Some)
                .ok_or_else(|| Error::Config(format!("unknown skip-to phase '{}'", target))),
            None => Ok(None),
        }
    }

    /// Runs every eligible phase of `ctx` in order.
    ///
    /// On failure the context keeps the state at the halt, and a failed
    /// checkpoint has been written.
    pub async fn run(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let plan = self.plan(ctx)?;
        let target = self.skip_target(ctx)?;
        let next_after = |index: usize| -> Option<&str> {
            plan.iter()
                .skip(index + 1)
                .find(|p| p.eligibility == Eligibility::Run)
                .map(|p| p.name.as_str())
        };

        if target.is_some() {
            ctx.skipped_phases = plan
                .iter()
                .filter(|p| p.eligibility == Eligibility::Skipped)
                .map(|p| p.name.clone())
                .collect();
        }

        let first = plan
            .iter()
            .find(|p| p.eligibility == Eligibility::Run)
            .map(|p| p.name.as_str());
        tracing::info!(
            task = %ctx.task_name,
            first_phase = ?first,
            budget = ctx.ledger.budget_limit(),
            spent = ctx.ledger.spent_total(),
            "starting workflow"
        );
        self.checkpoints.save(ctx, first)?;

        for (index, phase) in self.phases.iter().enumerate() {
            let def = phase.definition();
            let name = def.name.as_str();
            let eligibility = plan[index].eligibility;
            if target == Some(index) {
                ctx.skip_to = None;
            }

            if eligibility != Eligibility::Run {
                if eligibility == Eligibility::Disabled {
                    ctx.current_phase = Some(name.to_string());
                }
                tracing::info!(phase = %name, reason = eligibility.reason(), "skipping phase");
                self.events.emit(ProgressEvent::PhaseSkipped {
                    phase: name.to_string(),
                    reason: eligibility.reason().to_string(),
                });
                continue;
            }

            if let Err(e) = ctx.ledger.estimate_check(name, def.estimated_cost) {
                return Err(self.halt(ctx, name, e));
            }
            ctx.current_phase = Some(name.to_string());

            if self.gate.is_required(def) {
                if let Err(e) = self.await_approval(ctx, name).await {
                    return Err(self.halt(ctx, name, e));
                }
            }

            tracing::info!(phase = %name, estimated_cost = def.estimated_cost, "starting phase");
            self.events.emit(ProgressEvent::PhaseStarted {
                phase: name.to_string(),
            });

            let result = match phase.execute(&self.env, ctx).await {
                Ok(result) => result,
                Err(e) => PhaseResult::failed(e),
            };

            if let Err(e) = ctx.ledger.add_cost(name, result.cost) {
                return Err(self.halt(ctx, name, e));
            }

            let PhaseResult {
                cost,
                failure,
                artifacts,
                warnings,
                session_id,
                updates,
            } = result;
            ctx.apply(updates);
            ctx.warnings
                .extend(warnings.into_iter().map(|w| format!("[{}] {}", name, w)));

            if let Some(failure) = failure {
                return Err(self.halt(ctx, name, failure));
            }

            ctx.record_artifacts(name, artifacts);
            if let Some(session_id) = session_id {
                ctx.session_ids.insert(name.to_string(), session_id);
            }
            ctx.mark_phase_complete(name);
            if let Err(e) = self.checkpoints.save(ctx, next_after(index)) {
                return Err(self.halt(ctx, name, e));
            }

            tracing::info!(
                phase = %name,
                cost,
                spent = ctx.ledger.spent_total(),
                remaining = ctx.ledger.remaining(),
                "phase completed"
            );
            self.events.emit(ProgressEvent::PhaseCompleted {
                phase: name.to_string(),
                cost,
            });
        }

        self.checkpoints.save_with(
            ctx,
            None,
            CheckpointMarkers {
                status: RunStatus::Completed,
                ..Default::default()
            },
        )?;
        tracing::info!(
            task = %ctx.task_name,
            cost = ctx.ledger.spent_total(),
            phases = ctx.completed_phases.len(),
            "workflow completed"
        );
        Ok(())
    }

    /// Checkpoints a paused state, then blocks on the gate.
    async fn await_approval(&self, ctx: &WorkflowContext, phase: &str) -> Result<()> {
        if !self.gate.store().is_granted(&ctx.task_name, phase) {
            self.checkpoints.save_with(
                ctx,
                Some(phase),
                CheckpointMarkers {
                    status: RunStatus::PausedForApproval,
                    pending_approval: Some(phase.to_string()),
                    failure: None,
                },
            )?;
            self.events.emit(ProgressEvent::AwaitingApproval {
                phase: phase.to_string(),
            });
        }
        self.gate
            .wait(&ctx.task_name, phase, self.gate.timeout())
            .await
    }

    /// Records a failed checkpoint and hands the error back.
    fn halt(&self, ctx: &WorkflowContext, phase: &str, error: Error) -> Error {
        let record = FailureRecord::from_error(phase, &error, ctx);
        tracing::error!(
            phase = %phase,
            kind = %record.kind,
            error = %error,
            spent = record.spent,
            remaining = record.remaining,
            "workflow halted"
        );
        self.events.emit(ProgressEvent::PhaseFailed {
            phase: phase.to_string(),
            error: error.to_string(),
        });

        let markers = CheckpointMarkers {
            status: RunStatus::Failed,
            pending_approval: None,
            failure: Some(record),
        };
        if let Err(e) = self.checkpoints.save_with(ctx, Some(phase), markers) {
            tracing::error!(error = %e, "failed to save failure checkpoint");
        }
        error
    }
}
