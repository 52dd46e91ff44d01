//! Runs one phase invocation through the feedback or debate protocol.

use std::path::{Path, PathBuf};

use crate::agent::{AgentOutcome, AgentRequest, SharedExecutor};
use crate::context::PhaseArtifacts;
use crate::error::{Error, Result};
use crate::events::{EventSink, ProgressEvent};

use super::files::DebateFiles;
use super::prompts::DebatePromptBuilder;
use super::{DebateConfig, DebateMode, DebateState, Role, TranscriptEntry};

/// Inputs for one debate.
#[derive(Debug, Clone)]
pub struct DebateTask {
    pub phase: String,
    pub task_name: String,
    pub prompts: DebatePromptBuilder,
    pub working_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    /// Session the primary continues in its first call.
    pub resume_session: Option<String>,
}

/// Result of a debate, successful or not.
///
/// Costs are always complete, including calls made before a failure.
#[derive(Debug)]
pub struct DebateOutcome {
    pub cost: f64,
    pub primary_cost: f64,
    pub secondary_cost: f64,
    pub agent_calls: usize,
    pub state: DebateState,
    pub artifacts: PhaseArtifacts,
    /// Primary's last session, for context continuation.
    pub session_id: Option<String>,
    pub failure: Option<Error>,
}

impl DebateOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Default)]
struct Tally {
    primary_cost: f64,
    secondary_cost: f64,
    calls: usize,
    primary_session: Option<String>,
    secondary_session: Option<String>,
}

/// Drives a primary and a secondary agent through a debate protocol.
pub struct DebateOrchestrator {
    primary: SharedExecutor,
    secondary: SharedExecutor,
    config: DebateConfig,
    events: EventSink,
}

impl DebateOrchestrator {
    pub fn new(primary: SharedExecutor, secondary: SharedExecutor, config: DebateConfig) -> Self {
        Self {
            primary,
            secondary,
            config,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    fn executor(&self, role: Role) -> &SharedExecutor {
        match role {
            Role::Primary => &self.primary,
            Role::Secondary => &self.secondary,
        }
    }

    fn request(&self, task: &DebateTask, prompt: String, message: bool, resume: Option<String>) -> AgentRequest {
        let timeout = if message {
            self.config.message_timeout()
        } else {
            self.config.turn_timeout()
        };
        AgentRequest::new(prompt, &task.working_dir)
            .with_allowed_tools(task.allowed_tools.clone())
            .with_timeout(timeout)
            .with_max_turns(task.max_turns)
            .with_resume_session(resume)
    }

    /// Runs one call under its own timeout.
    async fn invoke(&self, role: Role, request: AgentRequest) -> Result<AgentOutcome> {
        let executor = self.executor(role);
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, executor.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::AgentTimeout {
                agent: executor.name().to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Books a call's cost, then fails if the agent did not succeed.
    fn settle(
        &self,
        phase: &str,
        tally: &mut Tally,
        role: Role,
        result: Result<AgentOutcome>,
    ) -> Result<AgentOutcome> {
        tally.calls += 1;
        let outcome = result?;
        match role {
            Role::Primary => {
                tally.primary_cost += outcome.cost;
                if outcome.session_id.is_some() {
                    tally.primary_session = outcome.session_id.clone();
                }
            }
            Role::Secondary => {
                tally.secondary_cost += outcome.cost;
                if outcome.session_id.is_some() {
                    tally.secondary_session = outcome.session_id.clone();
                }
            }
        }
        if !outcome.success {
            return Err(Error::PhaseFailed {
                phase: phase.to_string(),
                reason: format!(
                    "{} agent '{}' reported failure",
                    role,
                    self.executor(role).name()
                ),
            });
        }
        Ok(outcome)
    }

    async fn call(
        &self,
        task: &DebateTask,
        tally: &mut Tally,
        role: Role,
        request: AgentRequest,
    ) -> Result<AgentOutcome> {
        let result = self.invoke(role, request).await;
        self.settle(&task.phase, tally, role, result)
    }

    /// Runs the configured protocol for one phase.
    pub async fn run(&self, task: &DebateTask) -> Result<DebateOutcome> {
        let files = DebateFiles::new(
            &task.artifacts_dir,
            &self.config.debate_subdir,
            &task.phase,
            &task.task_name,
        );
        files.ensure_directories()?;

        tracing::info!(
            phase = %task.phase,
            mode = ?self.config.mode,
            primary = %self.primary.name(),
            secondary = %self.secondary.name(),
            "starting debate"
        );

        let mut tally = Tally::default();
        let mut state = DebateState::default();
        let result = match self.config.mode {
            DebateMode::Feedback => self.run_feedback(task, &files, &mut tally, &mut state).await,
            DebateMode::Debate => self.run_debate(task, &files, &mut tally, &mut state).await,
        };

        let cost = tally.primary_cost + tally.secondary_cost;
        let failure = result.err();
        match &failure {
            Some(e) => tracing::error!(phase = %task.phase, error = %e, cost, "debate failed"),
            None => tracing::info!(phase = %task.phase, cost, calls = tally.calls, "debate complete"),
        }

        let artifacts = self.artifacts(&files, &tally, &state);
        Ok(DebateOutcome {
            cost,
            primary_cost: tally.primary_cost,
            secondary_cost: tally.secondary_cost,
            agent_calls: tally.calls,
            state,
            artifacts,
            session_id: tally.primary_session,
            failure,
        })
    }

    async fn run_feedback(
        &self,
        task: &DebateTask,
        files: &DebateFiles,
        tally: &mut Tally,
        state: &mut DebateState,
    ) -> Result<()> {
        state.turn = 1;
        let prompt = task.prompts.generation(Role::Primary);
        let request = self.request(task, prompt, false, task.resume_session.clone());
        let draft = self.call(task, tally, Role::Primary, request).await?.output;
        std::fs::write(&files.primary, &draft)?;
        state.primary_output = Some(draft.clone());

        state.turn = 2;
        let request = self.request(task, task.prompts.review(&draft), false, None);
        let review = self.call(task, tally, Role::Secondary, request).await?.output;
        std::fs::write(&files.secondary, &review)?;
        state.secondary_output = Some(review.clone());
        state.transcript.push(TranscriptEntry {
            speaker: Role::Secondary,
            agent: self.secondary.name().to_string(),
            number: 1,
            message: review.clone(),
        });
        write_transcript(&files.transcript, task, DebateMode::Feedback, &state.transcript)?;

        state.turn = 3;
        let prompt = task.prompts.feedback_synthesis(&draft, &review);
        let request = self.request(task, prompt, false, tally.primary_session.clone());
        let final_output = self.call(task, tally, Role::Primary, request).await?.output;
        std::fs::write(&files.final_output, &final_output)?;
        state.final_output = Some(final_output);
        Ok(())
    }

    async fn run_debate(
        &self,
        task: &DebateTask,
        files: &DebateFiles,
        tally: &mut Tally,
        state: &mut DebateState,
    ) -> Result<()> {
        // Turn 1: independent generation.
        state.turn = 1;
        let primary_req = self.request(
            task,
            task.prompts.generation(Role::Primary),
            false,
            task.resume_session.clone(),
        );
        let secondary_req = self.request(task, task.prompts.generation(Role::Secondary), false, None);

        let (primary, secondary) = if self.config.parallel_turn_1 {
            tokio::join!(
                self.invoke(Role::Primary, primary_req),
                self.invoke(Role::Secondary, secondary_req)
            )
        } else {
            let primary = self.invoke(Role::Primary, primary_req).await;
            let secondary = self.invoke(Role::Secondary, secondary_req).await;
            (primary, secondary)
        };
        // Book both costs before surfacing either failure.
        let primary = self.settle(&task.phase, tally, Role::Primary, primary);
        let secondary = self.settle(&task.phase, tally, Role::Secondary, secondary);
        let primary_result = primary?.output;
        let secondary_result = secondary?.output;

        std::fs::write(&files.primary, &primary_result)?;
        std::fs::write(&files.secondary, &secondary_result)?;
        state.primary_output = Some(primary_result.clone());
        state.secondary_output = Some(secondary_result.clone());

        // Turn 2: alternating exchange, opened and closed by the primary.
        state.turn = 2;
        let total = self.config.intensity.message_count();
        let mut speaker = Role::Primary;
        for number in 1..=total {
            let (own, other) = match speaker {
                Role::Primary => (&primary_result, &secondary_result),
                Role::Secondary => (&secondary_result, &primary_result),
            };
            let prompt =
                task.prompts
                    .exchange_message(speaker, number, total, own, other, &state.transcript);
            let resume = match speaker {
                Role::Primary => tally.primary_session.clone(),
                Role::Secondary => tally.secondary_session.clone(),
            };
            let request = self.request(task, prompt, true, resume);
            let message = self.call(task, tally, speaker, request).await?.output;

            tracing::debug!(phase = %task.phase, number, speaker = %speaker, "debate message");
            self.events.emit(ProgressEvent::DebateMessage {
                phase: task.phase.clone(),
                speaker: speaker.to_string(),
                number,
            });
            state.transcript.push(TranscriptEntry {
                speaker,
                agent: self.executor(speaker).name().to_string(),
                number,
                message,
            });
            write_transcript(&files.transcript, task, DebateMode::Debate, &state.transcript)?;
            speaker = speaker.other();
        }

        // Turn 3: synthesis by the primary.
        state.turn = 3;
        let prompt = task
            .prompts
            .synthesis(&primary_result, &secondary_result, &state.transcript);
        let request = self.request(task, prompt, false, tally.primary_session.clone());
        let final_output = self.call(task, tally, Role::Primary, request).await?.output;
        std::fs::write(&files.final_output, &final_output)?;
        state.final_output = Some(final_output);
        Ok(())
    }

    fn artifacts(&self, files: &DebateFiles, tally: &Tally, state: &DebateState) -> PhaseArtifacts {
        let mut artifacts = PhaseArtifacts::new();
        let path = |p: &Path| serde_json::Value::from(p.to_string_lossy().to_string());
        let mode = match self.config.mode {
            DebateMode::Feedback => "feedback",
            DebateMode::Debate => "debate",
        };
        artifacts.insert("mode".into(), mode.into());
        if state.primary_output.is_some() {
            artifacts.insert("primary_output_file".into(), path(&files.primary));
        }
        if state.secondary_output.is_some() {
            artifacts.insert("secondary_output_file".into(), path(&files.secondary));
        }
        if !state.transcript.is_empty() {
            artifacts.insert("transcript_file".into(), path(&files.transcript));
        }
        if state.final_output.is_some() {
            artifacts.insert("output_file".into(), path(&files.final_output));
        }
        artifacts.insert("primary_agent".into(), self.primary.name().into());
        artifacts.insert("secondary_agent".into(), self.secondary.name().into());
        artifacts.insert(
            "total_cost".into(),
            (tally.primary_cost + tally.secondary_cost).into(),
        );
        artifacts.insert("primary_cost".into(), tally.primary_cost.into());
        artifacts.insert("secondary_cost".into(), tally.secondary_cost.into());
        artifacts.insert("message_count".into(), state.transcript.len().into());
        artifacts.insert("agent_calls".into(), tally.calls.into());
        artifacts
    }
}

fn write_transcript(
    path: &Path,
    task: &DebateTask,
    mode: DebateMode,
    transcript: &[TranscriptEntry],
) -> Result<()> {
    let mut doc = String::new();
    doc.push_str(&format!("# Debate: {}\n\n", task.phase));
    doc.push_str(&format!("**Task:** {}\n", task.task_name));
    doc.push_str(&format!("**Mode:** {:?}\n\n", mode));
    for entry in transcript {
        doc.push_str(&format!(
            "## Message {} ({}: {})\n\n{}\n\n",
            entry.number, entry.speaker, entry.agent, entry.message
        ));
    }
    std::fs::write(path, doc)?;
    Ok(())
}
