//! The workflow phase state machine.
//!
//! This is the only gate on phase mutation: every phase change goes through
//! `transition`, which rejects pairs outside the legal edge set. Persistence
//! is the orchestrator's job, not the machine's — `transition` has no side
//! effects beyond the in-memory state and subscriber notification.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::WorkflowError;

/// Where a workflow run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    Preflight,
    Clarifying,
    Snapshotting,
    Drafting,
    Reviewing,
    Revising,
    Completed,
    Error,
}

impl WorkflowPhase {
    /// Terminal phases accept no further work without an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Idle => "idle",
            WorkflowPhase::Preflight => "preflight",
            WorkflowPhase::Clarifying => "clarifying",
            WorkflowPhase::Snapshotting => "snapshotting",
            WorkflowPhase::Drafting => "drafting",
            WorkflowPhase::Reviewing => "reviewing",
            WorkflowPhase::Revising => "revising",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(from, to)` notification delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

/// Whether `(from, to)` is a legal workflow edge.
///
/// The forward chain runs `idle -> preflight -> clarifying -> snapshotting ->
/// drafting -> reviewing -> revising`, with `revising` looping back to
/// `reviewing` (next round) or finishing at `completed`. Any phase may fail
/// into `error`; `error` may reset to `idle` or retry directly into any
/// workflow phase. `idle` may also re-enter any phase when a resumed session
/// was interrupted mid-phase.
fn is_legal_edge(from: WorkflowPhase, to: WorkflowPhase) -> bool {
    use WorkflowPhase::*;

    if to == Error {
        return from != Error;
    }

    match from {
        Idle => to != Idle,
        Preflight => to == Clarifying,
        Clarifying => to == Snapshotting,
        Snapshotting => to == Drafting,
        Drafting => to == Reviewing,
        Reviewing => to == Revising,
        Revising => to == Reviewing || to == Completed,
        Completed => false,
        Error => to != Completed && to != Error,
    }
}

/// The authoritative phase holder. Single-writer: the orchestrator owns it.
pub struct PhaseMachine {
    current: WorkflowPhase,
    subscribers: Vec<mpsc::UnboundedSender<PhaseTransition>>,
}

impl PhaseMachine {
    /// Create a machine at `idle`.
    pub fn new() -> Self {
        Self::starting_at(WorkflowPhase::Idle)
    }

    /// Create a machine at a specific phase (used when resuming a session).
    pub fn starting_at(phase: WorkflowPhase) -> Self {
        Self {
            current: phase,
            subscribers: Vec::new(),
        }
    }

    pub fn current(&self) -> WorkflowPhase {
        self.current
    }

    /// Register a subscriber. Each legal transition delivers exactly one
    /// `(from, to)` notification per subscriber, in registration order.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PhaseTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Pure predicate: would `transition(to)` succeed right now?
    pub fn can_transition(&self, to: WorkflowPhase) -> bool {
        is_legal_edge(self.current, to)
    }

    /// Move to `to`, or fail with `InvalidTransition` leaving state untouched.
    pub fn transition(&mut self, to: WorkflowPhase) -> Result<(), WorkflowError> {
        if !self.can_transition(to) {
            return Err(WorkflowError::InvalidTransition {
                from: self.current,
                to,
            });
        }

        let event = PhaseTransition {
            from: self.current,
            to,
        };
        self.current = to;

        // Dropped receivers are pruned rather than treated as errors.
        self.subscribers.retain(|tx| tx.send(event).is_ok());

        Ok(())
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowPhase::*;

    const ALL: [WorkflowPhase; 9] = [
        Idle,
        Preflight,
        Clarifying,
        Snapshotting,
        Drafting,
        Reviewing,
        Revising,
        Completed,
        Error,
    ];

    fn forward_chain() -> Vec<(WorkflowPhase, WorkflowPhase)> {
        vec![
            (Idle, Preflight),
            (Preflight, Clarifying),
            (Clarifying, Snapshotting),
            (Snapshotting, Drafting),
            (Drafting, Reviewing),
            (Reviewing, Revising),
        ]
    }

    #[test]
    fn forward_chain_is_legal() {
        for (from, to) in forward_chain() {
            let machine = PhaseMachine::starting_at(from);
            assert!(machine.can_transition(to), "{from} -> {to} should be legal");
        }
    }

    #[test]
    fn revising_branches_to_next_round_or_completed() {
        let machine = PhaseMachine::starting_at(Revising);
        assert!(machine.can_transition(Reviewing));
        assert!(machine.can_transition(Completed));
        assert!(!machine.can_transition(Drafting));
    }

    #[test]
    fn any_phase_may_fail_into_error() {
        for from in ALL {
            let machine = PhaseMachine::starting_at(from);
            assert_eq!(machine.can_transition(Error), from != Error);
        }
    }

    #[test]
    fn error_recovers_to_idle_or_any_workflow_phase() {
        let machine = PhaseMachine::starting_at(Error);
        for to in [Idle, Preflight, Clarifying, Drafting, Reviewing, Revising] {
            assert!(machine.can_transition(to), "error -> {to} should be legal");
        }
        assert!(!machine.can_transition(Completed));
        assert!(!machine.can_transition(Error));
    }

    #[test]
    fn idle_reenters_any_phase_for_resume() {
        let machine = PhaseMachine::starting_at(Idle);
        for to in [Preflight, Clarifying, Snapshotting, Drafting, Reviewing, Revising, Completed] {
            assert!(machine.can_transition(to), "idle -> {to} should be legal");
        }
    }

    #[test]
    fn completed_is_terminal() {
        let machine = PhaseMachine::starting_at(Completed);
        for to in [Idle, Preflight, Reviewing, Revising] {
            assert!(!machine.can_transition(to));
        }
        assert!(machine.can_transition(Error));
        assert!(Completed.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Reviewing.is_terminal());
    }

    #[test]
    fn skipping_ahead_mid_chain_is_illegal() {
        let mut machine = PhaseMachine::starting_at(Preflight);
        let err = machine.transition(Drafting).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidTransition {
                from: Preflight,
                to: Drafting
            }
        ));
        // State unchanged on failure.
        assert_eq!(machine.current(), Preflight);
    }

    #[test]
    fn transition_notifies_each_subscriber_exactly_once() {
        let mut machine = PhaseMachine::new();
        let mut rx_a = machine.subscribe();
        let mut rx_b = machine.subscribe();

        machine.transition(Preflight).unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.from, Idle);
            assert_eq!(event.to, Preflight);
            assert!(rx.try_recv().is_err(), "exactly one notification expected");
        }
    }

    #[test]
    fn failed_transition_notifies_nobody() {
        let mut machine = PhaseMachine::starting_at(Completed);
        let mut rx = machine.subscribe();
        assert!(machine.transition(Reviewing).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let mut machine = PhaseMachine::new();
        let rx = machine.subscribe();
        drop(rx);
        machine.transition(Preflight).unwrap();
        machine.transition(Clarifying).unwrap();
        assert_eq!(machine.current(), Clarifying);
    }

    #[test]
    fn phase_serde_round_trip_uses_snake_case() {
        let json = serde_json::to_string(&Snapshotting).unwrap();
        assert_eq!(json, "\"snapshotting\"");
        let back: WorkflowPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Snapshotting);
    }
}
