//! Error types for the assembly-line workflow engine.

use thiserror::Error;

/// Top-level error type for workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Recording a cost would push total spend past the budget limit.
    #[error("budget exceeded: spent ${spent:.2} of ${limit:.2}, rejected ${rejected:.2}")]
    BudgetExceeded {
        spent: f64,
        limit: f64,
        rejected: f64,
    },

    /// Pre-flight check refused to start a phase.
    #[error("insufficient budget for phase '{phase}': ${remaining:.2} remaining, ${estimated:.2} estimated")]
    InsufficientBudget {
        phase: String,
        remaining: f64,
        estimated: f64,
    },

    /// No grant appeared for a gated phase before the wait timed out.
    #[error("approval for phase '{phase}' timed out after {elapsed_hours:.2} hours")]
    ApprovalTimeout { phase: String, elapsed_hours: f64 },

    /// No checkpoint exists under the given id.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// A checkpoint exists but cannot be decoded.
    #[error("checkpoint {id} is corrupt: {reason}")]
    CorruptCheckpoint { id: String, reason: String },

    /// An agent call exceeded its timeout.
    #[error("agent '{agent}' timed out after {secs} seconds")]
    AgentTimeout { agent: String, secs: u64 },

    /// The agent process could not be spawned or crashed.
    #[error("agent process error: {0}")]
    AgentProcess(String),

    /// New test failures remained after the last fix attempt.
    #[error("tests still failing in phase '{phase}' after retries: {}", remaining.join(", "))]
    TestsFailingAfterRetries {
        phase: String,
        remaining: Vec<String>,
    },

    /// A rebase stopped on conflicting files.
    #[error("conflicts in: {}", files.join(", "))]
    Conflict { files: Vec<String> },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A phase reported failure.
    #[error("phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: String, reason: String },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code reported by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::PhaseFailed { .. }
            | Error::TestsFailingAfterRetries { .. }
            | Error::AgentTimeout { .. }
            | Error::AgentProcess(_)
            | Error::Conflict { .. } => 3,
            Error::BudgetExceeded { .. } | Error::InsufficientBudget { .. } => 4,
            Error::ApprovalTimeout { .. } => 5,
            _ => 1,
        }
    }

    /// Short, stable name of the error kind, stored in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::InsufficientBudget { .. } => "insufficient_budget",
            Error::ApprovalTimeout { .. } => "approval_timeout",
            Error::CheckpointNotFound(_) => "checkpoint_not_found",
            Error::CorruptCheckpoint { .. } => "corrupt_checkpoint",
            Error::AgentTimeout { .. } => "agent_timeout",
            Error::AgentProcess(_) => "agent_process",
            Error::TestsFailingAfterRetries { .. } => "tests_failing_after_retries",
            Error::Conflict { .. } => "conflict",
            Error::Config(_) => "configuration",
            Error::PhaseFailed { .. } => "phase_failed",
            Error::Git(_) => "git",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for workflow operations.
pub type Result<T> = std::result::Result<T, Error>;
