//! Lifecycle events emitted during workflow execution.
//!
//! The orchestrator pushes events onto an unbounded channel the caller
//! drains; there are no callbacks and no global listener registry. Delivery
//! is ordered per channel.

use serde::{Deserialize, Serialize};

use crate::machine::WorkflowPhase;
use crate::state::ArtifactRef;

/// Progress events for any caller watching a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A phase procedure has started.
    PhaseStarted { phase: WorkflowPhase },
    /// A phase procedure finished and persisted its result.
    PhaseCompleted { phase: WorkflowPhase },
    /// Preflight probed one model.
    ModelProbed { model: String, reachable: bool },
    /// A streamed text fragment from the writer, for live display only.
    /// Phase decisions never gate on fragments.
    WriterFragment { text: String },
    /// One clarification exchange finished with a parsed reply.
    ClarificationTurn { ready: bool, message: String },
    /// An artifact was durably committed.
    ArtifactCommitted {
        reference: ArtifactRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
    },
    /// A review round began; `pending` lists the reviewers that will run.
    RoundStarted { round: u32, pending: Vec<String> },
    /// A reviewer call was submitted to the limiter.
    ReviewerStarted { round: u32, model: String },
    /// A reviewer call resolved.
    ReviewerFinished {
        round: u32,
        model: String,
        success: bool,
        duration_ms: u64,
    },
    /// All reviewers of a round completed and the aggregate was committed.
    RoundCompleted { round: u32 },
    /// The workflow reached `completed`.
    WorkflowCompleted {
        final_ref: ArtifactRef,
        version: u32,
    },
    /// The workflow transitioned to `error`.
    WorkflowFailed {
        phase: WorkflowPhase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = WorkflowEvent::RoundStarted {
            round: 1,
            pending: vec!["rev-a".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"round_started\""));
        assert!(json.contains("rev-a"));
    }

    #[test]
    fn reviewer_finished_round_trips() {
        let event = WorkflowEvent::ReviewerFinished {
            round: 2,
            model: "rev-b".into(),
            success: false,
            duration_ms: 1500,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            WorkflowEvent::ReviewerFinished { round: 2, success: false, .. }
        ));
    }
}
