//! Claude Code CLI executor.

use async_trait::async_trait;

use crate::context::PhaseArtifacts;
use crate::error::Result;
use crate::events::{EventSink, ProgressEvent};

use super::process::run_streaming;
use super::{AgentExecutor, AgentOutcome, AgentRequest};

/// Executor for the Claude Code CLI in `stream-json` mode.
pub struct ClaudeExecutor {
    /// Path to the claude CLI binary.
    cli_path: String,
    model: Option<String>,
    events: EventSink,
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed `stream-json` line.
#[derive(Debug, Clone, PartialEq)]
enum StreamLine {
    /// Final `result` event.
    Result {
        text: String,
        cost: f64,
        session_id: Option<String>,
        is_error: bool,
    },
    /// Assistant text block.
    Text(String),
    /// Assistant tool call.
    ToolUse(String),
    Other,
}

impl ClaudeExecutor {
    /// Creates an executor using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: None,
            events: EventSink::none(),
        }
    }

    /// Creates an executor with a custom CLI path.
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

    /// Builds the command arguments for a request.
    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(), // Required for stream-json
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];

        // The workspace is an isolated worktree, so edits need no prompts
        if request.write_access {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }

        if let Some(session) = &request.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(request.prompt.clone());

        args
    }

    fn parse_line(line: &str) -> StreamLine {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            return StreamLine::Other;
        };

        match json.get("type").and_then(|t| t.as_str()) {
            Some("result") => StreamLine::Result {
                text: json
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string(),
                cost: parse_cost(&json),
                session_id: json
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                is_error: json
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false),
            },
            Some("assistant") => {
                let content = json
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array());
                let Some(content) = content else {
                    return StreamLine::Other;
                };
                let mut text = String::new();
                for item in content {
                    match item.get("type").and_then(|t| t.as_str()) {
                        Some("tool_use") => {
                            let tool = item
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default();
                            return StreamLine::ToolUse(tool.to_string());
                        }
                        Some("text") => {
                            if let Some(t) = item.get("text").and_then(|t| t.as_str()) {
                                text.push_str(t);
                            }
                        }
                        _ => {}
                    }
                }
                if text.is_empty() {
                    StreamLine::Other
                } else {
                    StreamLine::Text(text)
                }
            }
            _ => StreamLine::Other,
        }
    }
}

/// Reads cost from any of the shapes the CLI has used.
fn parse_cost(json: &serde_json::Value) -> f64 {
    if let Some(cost) = json.get("total_cost_usd").and_then(|c| c.as_f64()) {
        return cost;
    }
    if let Some(cost) = json.get("cost_usd").and_then(|c| c.as_f64()) {
        return cost;
    }
    match json.get("cost") {
        Some(serde_json::Value::Object(map)) => {
            map.get("total_usd").and_then(|c| c.as_f64()).unwrap_or(0.0)
        }
        Some(other) => other.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

#[async_trait]
impl AgentExecutor for ClaudeExecutor {
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
                StreamLine::Text(text) => events.emit(ProgressEvent::AgentOutput {
                    agent: name.clone(),
                    line: text,
                }),
                StreamLine::ToolUse(tool) => events.emit(ProgressEvent::ToolCall {
                    agent: name.clone(),
                    tool,
                }),
                _ => {}
            },
        )
        .await?;

        let mut transcript = String::new();
        let mut result = None;
        for line in &output.stdout {
            match Self::parse_line(line) {
                StreamLine::Text(text) => {
                    transcript.push_str(&text);
                    transcript.push('\n');
                }
                r @ StreamLine::Result { .. } => result = Some(r),
                _ => {}
            }
        }

        let exit_ok = output.status.success();
        let outcome = match result {
            Some(StreamLine::Result {
                text,
                cost,
                session_id,
                is_error,
            }) => AgentOutcome {
                success: exit_ok && !is_error,
                cost,
                output: if text.is_empty() { transcript } else { text },
                artifacts: PhaseArtifacts::new(),
                session_id,
            },
            _ => {
                tracing::warn!(
                    exit = ?output.status.code(),
                    stderr = %output.stderr.join("\n"),
                    "claude produced no result event"
                );
                AgentOutcome {
                    success: false,
                    cost: 0.0,
                    output: if transcript.is_empty() {
                        output.stderr.join("\n")
                    } else {
                        transcript
                    },
                    artifacts: PhaseArtifacts::new(),
                    session_id: None,
                }
            }
        };

        tracing::info!(
            success = outcome.success,
            cost = outcome.cost,
            session = ?outcome.session_id,
            "claude finished"
        );
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "claude"
    }
}
