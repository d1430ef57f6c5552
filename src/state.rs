//! Persisted workflow state shapes.
//!
//! `WorkflowState` is the single source of truth for where a run is. The
//! orchestrator is its only writer and updates it strictly *after* the
//! artifact a change refers to has been durably committed, so a loaded state
//! never references anything that is not on disk.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::WorkflowPhase;

/// Reference to a committed artifact, relative to the session's artifact
/// directory. Artifacts are immutable: a new artifact is always a new file.
pub type ArtifactRef = String;

/// Per-reviewer completion status within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerStatus {
    Pending,
    Complete,
    Error,
}

/// One reviewer's slot in a round. Reviewer tasks write to independent slots;
/// nothing is shared between them until the round-completion join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerSlot {
    pub status: ReviewerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReviewerSlot {
    pub fn pending() -> Self {
        Self {
            status: ReviewerStatus::Pending,
            artifact_ref: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn complete(artifact_ref: ArtifactRef, duration_ms: u64) -> Self {
        Self {
            status: ReviewerStatus::Complete,
            artifact_ref: Some(artifact_ref),
            duration_ms: Some(duration_ms),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: ReviewerStatus::Error,
            artifact_ref: None,
            duration_ms: Some(duration_ms),
            error: Some(error.into()),
        }
    }
}

/// Bookkeeping for one review round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundState {
    /// Model id -> slot. BTreeMap keeps the persisted form deterministic.
    pub reviewers: BTreeMap<String, ReviewerSlot>,
    /// Combined feedback bundle; set only once every reviewer is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_ref: Option<ArtifactRef>,
    /// The writer's revision produced from this round's feedback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_artifact_ref: Option<ArtifactRef>,
}

impl RoundState {
    /// Initialize slots for a fresh round: every configured reviewer pending.
    pub fn for_reviewers<'a>(models: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            reviewers: models
                .into_iter()
                .map(|m| (m.to_string(), ReviewerSlot::pending()))
                .collect(),
            aggregate_ref: None,
            revised_artifact_ref: None,
        }
    }

    /// A round succeeds iff *every* reviewer completed. Any error slot marks
    /// the whole round failed; partial success is not a terminal state.
    pub fn is_successful(&self) -> bool {
        !self.reviewers.is_empty()
            && self
                .reviewers
                .values()
                .all(|slot| slot.status == ReviewerStatus::Complete)
    }

    /// Models that still need to run: everything not marked complete.
    /// Error slots are retried on resume, not skipped.
    pub fn pending_reviewers(&self) -> Vec<String> {
        self.reviewers
            .iter()
            .filter(|(_, slot)| slot.status != ReviewerStatus::Complete)
            .map(|(model, _)| model.clone())
            .collect()
    }

    /// Models whose slot is an error.
    pub fn failed_reviewers(&self) -> Vec<String> {
        self.reviewers
            .iter()
            .filter(|(_, slot)| slot.status == ReviewerStatus::Error)
            .map(|(model, _)| model.clone())
            .collect()
    }
}

/// The last failure the workflow hit, kept for `status` and resume-from-error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The durable picture of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Session identifier, assigned at creation.
    pub session_id: uuid::Uuid,
    /// The idea this session is specifying.
    pub idea: String,
    pub phase: WorkflowPhase,
    /// Meaningful only in `reviewing`/`revising`; 0 before the first round.
    pub current_round: u32,
    /// Highest committed draft/revision version.
    pub latest_artifact_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_ref: Option<ArtifactRef>,
    /// Version 1 of the document, produced by the draft phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_ref: Option<ArtifactRef>,
    /// Reference to the designated final artifact, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_ref: Option<ArtifactRef>,
    #[serde(default)]
    pub rounds: BTreeMap<u32, RoundState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state at session start.
    pub fn new(idea: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4(),
            idea: idea.into(),
            phase: WorkflowPhase::Idle,
            current_round: 0,
            latest_artifact_version: 0,
            snapshot_ref: None,
            transcript_ref: None,
            draft_ref: None,
            final_ref: None,
            rounds: BTreeMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Record a failure: phase, message, offending model, timestamp.
    pub fn record_error(&mut self, phase: WorkflowPhase, message: &str, model_id: Option<&str>) {
        self.phase = WorkflowPhase::Error;
        self.last_error = Some(LastError {
            message: message.to_string(),
            phase,
            model_id: model_id.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    /// The reference of the newest committed draft/revision, if any.
    pub fn current_artifact_ref(&self) -> Option<&ArtifactRef> {
        if self.latest_artifact_version == 0 {
            return None;
        }
        // Revisions live in their round; version 1 is the draft.
        self.rounds
            .values()
            .rev()
            .find_map(|round| round.revised_artifact_ref.as_ref())
            .or(self.draft_ref.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_idle_and_empty() {
        let state = WorkflowState::new("a todo app");
        assert_eq!(state.phase, WorkflowPhase::Idle);
        assert_eq!(state.current_round, 0);
        assert_eq!(state.latest_artifact_version, 0);
        assert!(state.snapshot_ref.is_none());
        assert!(state.rounds.is_empty());
        assert!(!state.is_terminal());
    }

    #[test]
    fn round_success_requires_all_complete() {
        let mut round = RoundState::for_reviewers(["a", "b"]);
        assert!(!round.is_successful());

        round
            .reviewers
            .insert("a".into(), ReviewerSlot::complete("r1-a.md".into(), 1200));
        assert!(!round.is_successful(), "one pending reviewer fails the round");

        round
            .reviewers
            .insert("b".into(), ReviewerSlot::complete("r1-b.md".into(), 900));
        assert!(round.is_successful());
    }

    #[test]
    fn any_error_slot_fails_the_round() {
        let mut round = RoundState::for_reviewers(["a", "b"]);
        round
            .reviewers
            .insert("a".into(), ReviewerSlot::complete("r1-a.md".into(), 100));
        round
            .reviewers
            .insert("b".into(), ReviewerSlot::failed("timeout", 5000));
        assert!(!round.is_successful());
        assert_eq!(round.failed_reviewers(), vec!["b".to_string()]);
    }

    #[test]
    fn pending_reviewers_excludes_only_complete() {
        let mut round = RoundState::for_reviewers(["a", "b", "c"]);
        round
            .reviewers
            .insert("a".into(), ReviewerSlot::complete("r1-a.md".into(), 100));
        round
            .reviewers
            .insert("c".into(), ReviewerSlot::failed("reset", 300));

        // Both pending and errored reviewers re-run on resume.
        assert_eq!(round.pending_reviewers(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn empty_round_is_not_successful() {
        assert!(!RoundState::default().is_successful());
    }

    #[test]
    fn record_error_captures_phase_and_model() {
        let mut state = WorkflowState::new("idea");
        state.record_error(WorkflowPhase::Reviewing, "model b failed", Some("model-b"));

        assert_eq!(state.phase, WorkflowPhase::Error);
        let err = state.last_error.as_ref().unwrap();
        assert_eq!(err.phase, WorkflowPhase::Reviewing);
        assert_eq!(err.model_id.as_deref(), Some("model-b"));
        assert!(err.message.contains("model b"));
    }

    #[test]
    fn state_serde_round_trip() {
        let mut state = WorkflowState::new("idea");
        state.phase = WorkflowPhase::Reviewing;
        state.current_round = 1;
        state.latest_artifact_version = 1;
        state
            .rounds
            .insert(1, RoundState::for_reviewers(["a", "b"]));

        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase, WorkflowPhase::Reviewing);
        assert_eq!(back.current_round, 1);
        assert_eq!(back.rounds[&1].reviewers.len(), 2);
        assert_eq!(back.session_id, state.session_id);
    }
}
