//! Coding-agent executors.
//!
//! An executor turns a prompt plus tool permissions into a single result
//! with a cost, a success flag and the agent's output. Claude Code and Codex
//! CLIs are supported in headless JSON mode.

mod claude;
mod codex;
mod process;

pub use claude::ClaudeExecutor;
pub use codex::CodexExecutor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::PhaseArtifacts;
use crate::error::Result;
use crate::events::EventSink;

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub prompt: String,
    /// Tools the agent may use. Empty means the backend default.
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    pub max_turns: u32,
    /// Session to continue. `None` starts a fresh context.
    pub resume_session: Option<String>,
    pub working_dir: PathBuf,
    /// Whether the agent may modify the workspace.
    pub write_access: bool,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            allowed_tools: Vec::new(),
            timeout: Duration::from_secs(600),
            max_turns: 30,
            resume_session: None,
            working_dir: working_dir.into(),
            write_access: false,
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_resume_session(mut self, session: Option<String>) -> Self {
        self.resume_session = session;
        self
    }

    pub fn with_write_access(mut self, write_access: bool) -> Self {
        self.write_access = write_access;
        self
    }
}

/// Terminal result of an agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub success: bool,
    /// Cost reported by the backend, in USD.
    pub cost: f64,
    /// Final text the agent produced.
    pub output: String,
    pub artifacts: PhaseArtifacts,
    pub session_id: Option<String>,
}

/// Trait for agent backends.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs the agent to completion.
    ///
    /// Fails with `AgentTimeout` when `request.timeout` elapses and with
    /// `AgentProcess` when the process cannot run. A process that runs but
    /// reports an error returns `Ok` with `success == false`.
    async fn execute(&self, request: AgentRequest) -> Result<AgentOutcome>;

    /// Returns the name of this executor.
    fn name(&self) -> &str;
}

/// Shared executor handle.
pub type SharedExecutor = Arc<dyn AgentExecutor>;

/// Supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Codex,
}

impl AgentKind {
    /// Creates an executor for this backend.
    pub fn create_executor(
        &self,
        cli_path: Option<&str>,
        model: Option<&str>,
        events: EventSink,
    ) -> SharedExecutor {
        match self {
            AgentKind::Claude => {
                let mut executor = match cli_path {
                    Some(path) => ClaudeExecutor::with_cli_path(path),
                    None => ClaudeExecutor::new(),
                };
                if let Some(model) = model {
                    executor = executor.with_model(model);
                }
                Arc::new(executor.with_events(events))
            }
            AgentKind::Codex => {
                let mut executor = match cli_path {
                    Some(path) => CodexExecutor::with_cli_path(path),
                    None => CodexExecutor::new(),
                };
                if let Some(model) = model {
                    executor = executor.with_model(model);
                }
                Arc::new(executor.with_events(events))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
