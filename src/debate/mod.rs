//! Two-agent debate and feedback protocols.
//!
//! Feedback mode: primary drafts, secondary reviews, primary revises.
//! Debate mode: both agents generate independently, exchange an odd number
//! of alternating messages opened and closed by the primary, then the
//! primary synthesizes the final result.

pub mod files;
mod orchestrator;
pub mod prompts;

pub use files::DebateFiles;
pub use orchestrator::{DebateOrchestrator, DebateOutcome, DebateTask};
pub use prompts::DebatePromptBuilder;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which protocol to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebateMode {
    /// Primary drafts, secondary reviews, primary revises.
    #[default]
    Feedback,
    /// Independent generation, exchange, synthesis.
    Debate,
}

/// Length of the Turn 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    #[default]
    Low,
    High,
}

impl Intensity {
    /// Number of exchange messages. Always odd so the primary closes.
    pub fn message_count(&self) -> usize {
        match self {
            Intensity::Low => 3,
            Intensity::High => 5,
        }
    }
}

/// Participant in a debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn other(&self) -> Role {
        match self {
            Role::Primary => Role::Secondary,
            Role::Secondary => Role::Primary,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Secondary => f.write_str("secondary"),
        }
    }
}

/// One message of the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Role,
    /// Executor name of the speaker.
    pub agent: String,
    /// 1-based position in the exchange.
    pub number: usize,
    pub message: String,
}

/// Working state of one debate. Discarded after synthesis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebateState {
    /// Turn in progress (1 to 3).
    pub turn: u8,
    pub primary_output: Option<String>,
    pub secondary_output: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub final_output: Option<String>,
}

/// Phases that can run under the debate orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebatePhases {
    #[serde(default = "default_true")]
    pub research: bool,
    #[serde(default = "default_true")]
    pub planning: bool,
    #[serde(default = "default_true")]
    pub plan_review: bool,
    #[serde(default = "default_true")]
    pub code_review: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DebatePhases {
    fn default() -> Self {
        Self {
            research: true,
            planning: true,
            plan_review: true,
            code_review: true,
        }
    }
}

impl DebatePhases {
    pub fn is_enabled(&self, phase: &str) -> bool {
        match phase {
            "research" => self.research,
            "planning" => self.planning,
            "plan_review" => self.plan_review,
            "code_review" => self.code_review,
            _ => false,
        }
    }
}

/// Configuration for debate and feedback runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    /// Whether debate-capable phases use two agents.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: DebateMode,
    #[serde(default)]
    pub intensity: Intensity,
    /// Run Turn 1 generations concurrently.
    #[serde(default = "default_true")]
    pub parallel_turn_1: bool,
    /// Timeout for generation and synthesis calls, in seconds.
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,
    /// Timeout for each exchange message, in seconds.
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: u64,
    /// Subdirectory of the artifacts dir for transcripts.
    #[serde(default = "default_debate_subdir")]
    pub debate_subdir: String,
    #[serde(default)]
    pub phases: DebatePhases,
}

fn default_turn_timeout() -> u64 {
    300
}

fn default_message_timeout() -> u64 {
    180
}

fn default_debate_subdir() -> String {
    "debates".to_string()
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DebateMode::default(),
            intensity: Intensity::default(),
            parallel_turn_1: true,
            turn_timeout_secs: default_turn_timeout(),
            message_timeout_secs: default_message_timeout(),
            debate_subdir: default_debate_subdir(),
            phases: DebatePhases::default(),
        }
    }
}

impl DebateConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    /// Whether `phase` runs under the orchestrator.
    pub fn applies_to(&self, phase: &str) -> bool {
        self.enabled && self.phases.is_enabled(phase)
    }
}
