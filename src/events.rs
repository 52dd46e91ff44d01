//! Optional progress events for display.
//!
//! Events are best-effort: a full or dropped receiver never blocks or fails
//! the workflow.

use tokio::sync::mpsc;

/// Something observable happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PhaseStarted { phase: String },
    PhaseSkipped { phase: String, reason: String },
    PhaseCompleted { phase: String, cost: f64 },
    PhaseFailed { phase: String, error: String },
    AwaitingApproval { phase: String },
    /// A line of agent output.
    AgentOutput { agent: String, line: String },
    /// The agent invoked a tool.
    ToolCall { agent: String, tool: String },
    DebateMessage { phase: String, speaker: String, number: usize },
}

/// Sender side of the progress channel. Cloneable and possibly inert.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    /// A sink that discards every event.
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a sink and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                tracing::trace!(error = %e, "progress event dropped");
            }
        }
    }
}
