//! Codex CLI executor.

use async_trait::async_trait;

use crate::context::PhaseArtifacts;
use crate::error::Result;
use crate::events::{EventSink, ProgressEvent};

use super::process::run_streaming;
use super::{AgentExecutor, AgentOutcome, AgentRequest};

/// Executor for `codex exec --json`.
///
/// Codex does not report cost or honor tool allow-lists, so outcomes always
/// carry zero cost.
pub struct CodexExecutor {
    cli_path: String,
    model: Option<String>,
    events: EventSink,
}

impl Default for CodexExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CodexEvent {
    ThreadStarted(String),
    AgentMessage(String),
    Command(String),
    Failed(String),
    Other,
}

impl CodexExecutor {
    pub fn new() -> Self {
        Self {
            cli_path: "codex".to_string(),
            model: None,
            events: EventSink::none(),
        }
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            ..Self::new()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(session) = &request.resume_session {
            args.push("resume".to_string());
            args.push(session.clone());
        }

        if request.write_access {
            args.push("--full-auto".to_string());
        } else {
            args.push("-s".to_string());
            args.push("read-only".to_string());
        }

        if let Some(model) = &self.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }

        args.push("--skip-git-repo-check".to_string());
        args.push("--json".to_string());
        args.push(request.prompt.clone());
        args
    }

    fn parse_line(line: &str) -> CodexEvent {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            return CodexEvent::Other;
        };
        let str_field = |v: &serde_json::Value, key: &str| {
            v.get(key)
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string()
        };

        match json.get("type").and_then(|t| t.as_str()) {
            Some("thread.started") => CodexEvent::ThreadStarted(str_field(&json, "thread_id")),
            Some("item.completed") | Some("item.started") => {
                let Some(item) = json.get("item") else {
                    return CodexEvent::Other;
                };
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("agent_message") => CodexEvent::AgentMessage(str_field(item, "text")),
                    Some("command_execution") => CodexEvent::Command(str_field(item, "command")),
                    _ => CodexEvent::Other,
                }
            }
            Some("turn.failed") => CodexEvent::Failed(
                json.get("error")
                    .map(|e| str_field(e, "message"))
                    .unwrap_or_default(),
            ),
            Some("error") => CodexEvent::Failed(str_field(&json, "message")),
            _ => CodexEvent::Other,
        }
    }
}

#[async_trait]
impl AgentExecutor for CodexExecutor {
    async fn execute(&self, request: AgentRequest) -> Result<AgentOutcome> {
        let args = self.build_args(&request);
        let events = self.events.clone();
        let name = self.name().to_string();

        let output = run_streaming(
            &name,
            &self.cli_path,
            &args,
            &request.working_dir,
            request.timeout,
            |line| match Self::parse_line(line) {
                CodexEvent::AgentMessage(text) => events.emit(ProgressEvent::AgentOutput {
                    agent: name.clone(),
                    line: text,
                }),
                CodexEvent::Command(command) => events.emit(ProgressEvent::ToolCall {
                    agent: name.clone(),
                    tool: command,
                }),
                _ => {}
            },
        )
        .await?;

        let mut session_id = None;
        let mut last_message = String::new();
        let mut failure = None;
        for line in &output.stdout {
            match Self::parse_line(line) {
                CodexEvent::ThreadStarted(id) if !id.is_empty() => session_id = Some(id),
                CodexEvent::AgentMessage(text) => last_message = text,
                CodexEvent::Failed(message) => failure = Some(message),
                _ => {}
            }
        }

        if let Some(message) = &failure {
            tracing::warn!(error = %message, "codex reported failure");
        }

        Ok(AgentOutcome {
            success: output.status.success() && failure.is_none(),
            cost: 0.0,
            output: last_message,
            artifacts: PhaseArtifacts::new(),
            session_id,
        })
    }

    fn name(&self) -> &str {
        "codex"
    }
}
