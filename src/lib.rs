//! Assembly Line - resumable, cost-bounded agent workflow engine
//!
//! This library drives a software-development task through an ordered
//! pipeline of phases executed by coding agents, with a hard spend limit,
//! durable checkpoints, human approval gates, bounded fix loops and
//! optional two-agent debate.

pub mod agent;
pub mod approval;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod context;
pub mod debate;
pub mod error;
pub mod events;
pub mod fixloop;
pub mod ledger;
pub mod phases;
pub mod sequencer;
pub mod vcs;

pub use error::{Error, Result};

pub use agent::{AgentExecutor, AgentKind, AgentOutcome, AgentRequest, SharedExecutor};
pub use approval::{ApprovalGate, ApprovalRecord, ApprovalStore};
pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary, FailureRecord, RunStatus};
pub use commands::DetectedCommands;
pub use config::{Validate, ValidationResult, WorkflowConfig};
pub use context::{ContextUpdate, WorkflowContext};
pub use debate::{DebateConfig, DebateMode, DebateOrchestrator, DebateOutcome, Intensity};
pub use events::{EventSink, ProgressEvent};
pub use fixloop::{BaselineFailureSet, FixLoopController, FixLoopReport};
pub use ledger::CostLedger;
pub use phases::{Phase, PhaseDefinition, PhaseEnv, PhaseKind, PhaseResult};
pub use sequencer::{Eligibility, Orchestrator, PlannedPhase};
pub use vcs::{GitVcs, VersionControl};
