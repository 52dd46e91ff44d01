//! Prompt builders for debate and feedback turns.

use super::{Role, TranscriptEntry};

/// Builds the prompts for every turn of one debate.
#[derive(Debug, Clone)]
pub struct DebatePromptBuilder {
    phase: String,
    task_description: String,
    brief: String,
    context_files: Vec<String>,
}

impl DebatePromptBuilder {
    /// Creates a builder for a phase and task.
    pub fn new(phase: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            task_description: task_description.into(),
            brief: String::new(),
            context_files: Vec::new(),
        }
    }

    /// Sets the phase-specific instructions.
    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }

    /// Adds a file agents should read for context.
    pub fn with_context_file(mut self, path: impl Into<String>) -> Self {
        self.context_files.push(path.into());
        self
    }

    fn header(&self, prompt: &mut String) {
        prompt.push_str(&format!("# {} phase\n\n", self.phase));
        prompt.push_str("## Task\n\n");
        prompt.push_str(&self.task_description);
        prompt.push_str("\n\n");
        if !self.brief.is_empty() {
            prompt.push_str("## Instructions\n\n");
            prompt.push_str(&self.brief);
            prompt.push_str("\n\n");
        }
        if !self.context_files.is_empty() {
            prompt.push_str("## Context files\n\n");
            for file in &self.context_files {
                prompt.push_str(&format!("- {}\n", file));
            }
            prompt.push('\n');
        }
    }

    /// Turn 1: independent generation. Also the primary's draft in feedback mode.
    pub fn generation(&self, role: Role) -> String {
        let mut prompt = String::new();
        self.header(&mut prompt);
        prompt.push_str(&format!(
            "You are the {} agent. Work independently and produce your complete result \
             as your final message.\n",
            role
        ));
        prompt
    }

    /// Turn 2: one message of the exchange.
    pub fn exchange_message(
        &self,
        speaker: Role,
        number: usize,
        total: usize,
        own_result: &str,
        other_result: &str,
        transcript: &[TranscriptEntry],
    ) -> String {
        let mut prompt = String::new();
        self.header(&mut prompt);

        prompt.push_str(&format!(
            "You are the {} agent in a structured debate. This is message {} of {}.\n\n",
            speaker, number, total
        ));
        prompt.push_str("## Your independent result\n\n");
        prompt.push_str(own_result);
        prompt.push_str("\n\n## The other agent's independent result\n\n");
        prompt.push_str(other_result);
        prompt.push_str("\n\n");

        if !transcript.is_empty() {
            prompt.push_str("## Debate so far\n\n");
            for entry in transcript {
                prompt.push_str(&format!(
                    "### Message {} ({})\n\n{}\n\n",
                    entry.number, entry.speaker, entry.message
                ));
            }
        }

        if number == total {
            prompt.push_str(
                "This is the closing message. Summarise the points of agreement and \
                 the decisions that remain contested.\n",
            );
        } else {
            prompt.push_str(
                "Critique the weakest points of the other position, concede what is \
                 right, and defend what you still believe.\n",
            );
        }
        prompt
    }

    /// Turn 3: the primary merges everything into the final result.
    pub fn synthesis(
        &self,
        primary_result: &str,
        secondary_result: &str,
        transcript: &[TranscriptEntry],
    ) -> String {
        let mut prompt = String::new();
        self.header(&mut prompt);

        prompt.push_str("You are the primary agent. Synthesize the final result.\n\n");
        prompt.push_str("## Primary result\n\n");
        prompt.push_str(primary_result);
        prompt.push_str("\n\n## Secondary result\n\n");
        prompt.push_str(secondary_result);
        prompt.push_str("\n\n## Debate transcript\n\n");
        for entry in transcript {
            prompt.push_str(&format!(
                "### Message {} ({})\n\n{}\n\n",
                entry.number, entry.speaker, entry.message
            ));
        }
        prompt.push_str(
            "Produce one complete result that keeps the strongest ideas from both sides \
             and resolves every contested point explicitly.\n",
        );
        prompt
    }

    /// Feedback mode: the secondary reviews the primary's draft.
    pub fn review(&self, draft: &str) -> String {
        let mut prompt = String::new();
        self.header(&mut prompt);

        prompt.push_str(
            "You are the reviewing agent. Do not produce your own result. Review the \
             draft below and list concrete problems, omissions and risks.\n\n",
        );
        prompt.push_str("## Draft\n\n");
        prompt.push_str(draft);
        prompt.push('\n');
        prompt
    }

    /// Feedback mode: the primary incorporates the review.
    pub fn feedback_synthesis(&self, draft: &str, review: &str) -> String {
        let mut prompt = String::new();
        self.header(&mut prompt);

        prompt.push_str("You are the primary agent. Revise your draft using the review.\n\n");
        prompt.push_str("## Your draft\n\n");
        prompt.push_str(draft);
        prompt.push_str("\n\n## Review\n\n");
        prompt.push_str(review);
        prompt.push_str(
            "\n\nAddress every valid point and produce the complete final result.\n",
        );
        prompt
    }
}
