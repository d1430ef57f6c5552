//! The workflow engine.
//!
//! `Orchestrator` drives one session through clarify → snapshot → draft →
//! review → revise, owning the phase machine, the persisted state, and the
//! gateway handle. Every phase procedure follows the same shape: enter the
//! phase (persisting it), do the work, commit artifacts, then persist the
//! references together with the next phase transition. State on disk never
//! references an artifact that is not already committed.
//!
//! Abort is cooperative: an [`AbortHandle`] flips a watch flag the engine
//! checks at every suspension point. An abort between commits leaves the
//! session resumable; committed state is never rolled back.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;
use crate::errors::{GatewayError, WorkflowError};
use crate::gateway::{ChatMessage, ModelGateway};
use crate::limiter::run_limited;
use crate::machine::{PhaseMachine, PhaseTransition, WorkflowPhase};
use crate::prompts;
use crate::retry::RetryPolicy;
use crate::signals::{self, WriterReply};
use crate::state::{ArtifactRef, ReviewerSlot, ReviewerStatus, RoundState, WorkflowState};
use crate::store::SessionStore;
use crate::transcript::{Transcript, TurnRole};

use super::events::WorkflowEvent;

/// Requests a cooperative stop of the owning orchestrator. Cloneable and
/// usable from any task; signalling twice is harmless.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

struct ReviewSuccess {
    text: String,
    duration_ms: u64,
}

struct ReviewFailure {
    error: GatewayError,
    duration_ms: u64,
}

/// Drives one workflow session to completion.
pub struct Orchestrator {
    gateway: Arc<dyn ModelGateway>,
    config: WorkflowConfig,
    store: SessionStore,
    machine: PhaseMachine,
    state: WorkflowState,
    transcript: Transcript,
    event_tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
    abort_tx: Arc<watch::Sender<bool>>,
    abort_rx: watch::Receiver<bool>,
    preflight_retry: RetryPolicy,
    writer_retry: RetryPolicy,
    review_retry: RetryPolicy,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start a fresh session for `idea`. The initial state is persisted
    /// immediately so `status` works before the first phase runs.
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        config: WorkflowConfig,
        store: SessionStore,
        idea: impl Into<String>,
    ) -> Result<Self, WorkflowError> {
        config.validate().map_err(WorkflowError::Other)?;
        let state = WorkflowState::new(idea);
        store.save_state(&state)?;

        let (abort_tx, abort_rx) = watch::channel(false);
        Ok(Self {
            gateway,
            config,
            store,
            machine: PhaseMachine::new(),
            state,
            transcript: Transcript::new(),
            event_tx: None,
            abort_tx: Arc::new(abort_tx),
            abort_rx,
            preflight_retry: RetryPolicy::preflight(),
            writer_retry: RetryPolicy::default(),
            review_retry: RetryPolicy::review(),
        })
    }

    /// Resume a persisted session. The machine starts at the loaded phase, so
    /// a run interrupted mid-phase re-enters that phase and redoes only the
    /// uncommitted work.
    pub fn resume(
        gateway: Arc<dyn ModelGateway>,
        config: WorkflowConfig,
        store: SessionStore,
    ) -> Result<Self, WorkflowError> {
        config.validate().map_err(WorkflowError::Other)?;
        let state = store
            .load_state()?
            .ok_or_else(|| WorkflowError::BadRequest("no session to resume".into()))?;
        let transcript = store.load_transcript()?.unwrap_or_default();
        info!(session = %state.session_id, phase = %state.phase, "resuming session");

        let (abort_tx, abort_rx) = watch::channel(false);
        Ok(Self {
            gateway,
            config,
            store,
            machine: PhaseMachine::starting_at(state.phase),
            state,
            transcript,
            event_tx: None,
            abort_tx: Arc::new(abort_tx),
            abort_rx,
            preflight_retry: RetryPolicy::preflight(),
            writer_retry: RetryPolicy::default(),
            review_retry: RetryPolicy::review(),
        })
    }

    /// Attach a channel that receives every [`WorkflowEvent`] this engine
    /// emits. Send failures are ignored; a dropped receiver never stalls the
    /// workflow.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Override the retry policies (tests tighten these).
    pub fn with_retry_policies(
        mut self,
        preflight: RetryPolicy,
        writer: RetryPolicy,
        review: RetryPolicy,
    ) -> Self {
        self.preflight_retry = preflight;
        self.writer_retry = writer;
        self.review_retry = review;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Handle for aborting this run from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: Arc::clone(&self.abort_tx),
        }
    }

    /// Subscribe to raw phase transitions (see [`PhaseMachine::subscribe`]).
    pub fn subscribe_phases(&mut self) -> mpsc::UnboundedReceiver<PhaseTransition> {
        self.machine.subscribe()
    }

    /// Run preflight and open the clarification conversation. Returns the
    /// writer's first reply.
    pub async fn start(&mut self) -> Result<WriterReply, WorkflowError> {
        let result = self.start_inner().await;
        if let Err(err) = &result {
            self.handle_failure(err);
        }
        result
    }

    async fn start_inner(&mut self) -> Result<WriterReply, WorkflowError> {
        match self.state.phase {
            WorkflowPhase::Idle | WorkflowPhase::Preflight => {
                self.run_preflight().await?;
                self.enter_phase(WorkflowPhase::Clarifying)?;
                self.emit(WorkflowEvent::PhaseStarted {
                    phase: WorkflowPhase::Clarifying,
                });
                let opening = prompts::clarification_opening(&self.state.idea);
                self.clarify_exchange(opening).await
            }
            WorkflowPhase::Clarifying => {
                if self.transcript.is_empty() {
                    let opening = prompts::clarification_opening(&self.state.idea);
                    return self.clarify_exchange(opening).await;
                }
                // A resumed conversation: surface the writer's last question
                // instead of re-asking it.
                let last = self
                    .transcript
                    .turns
                    .iter()
                    .rev()
                    .find(|turn| turn.role == TurnRole::Assistant)
                    .map(|turn| turn.content.clone())
                    .ok_or_else(|| {
                        WorkflowError::BadRequest(
                            "clarification already in flight; answer with clarify".into(),
                        )
                    })?;
                Ok(WriterReply {
                    ready: false,
                    message: last,
                    notes: None,
                })
            }
            other => Err(WorkflowError::BadRequest(format!(
                "cannot start from phase {other}"
            ))),
        }
    }

    /// Feed the user's answer to the writer and return its next reply.
    pub async fn clarify(&mut self, answer: impl Into<String>) -> Result<WriterReply, WorkflowError> {
        if self.state.phase != WorkflowPhase::Clarifying {
            return Err(WorkflowError::BadRequest(format!(
                "clarify is only valid in the clarifying phase, not {}",
                self.state.phase
            )));
        }
        let result = self.clarify_exchange(answer.into()).await;
        if let Err(err) = &result {
            self.handle_failure(err);
        }
        result
    }

    async fn clarify_exchange(&mut self, user_text: String) -> Result<WriterReply, WorkflowError> {
        self.transcript.push_user(user_text);
        let messages = self
            .transcript
            .as_messages(prompts::CLARIFICATION_SYSTEM_PROMPT);

        // The user turn is only kept once the writer answered it, so a failed
        // exchange can simply be repeated.
        let raw = match self.writer_call_streaming(messages).await {
            Ok(raw) => raw,
            Err(err) => {
                self.transcript.turns.pop();
                return Err(err);
            }
        };
        let reply = match signals::parse_writer_reply(&raw) {
            Ok(reply) => reply,
            Err(err) => {
                self.transcript.turns.pop();
                return Err(err);
            }
        };

        self.transcript.push_assistant(&reply.message);
        self.store.save_transcript(&self.transcript)?;
        self.emit(WorkflowEvent::ClarificationTurn {
            ready: reply.ready,
            message: reply.message.clone(),
        });
        Ok(reply)
    }

    /// Drive the workflow from the current phase to `completed` and return
    /// the final artifact reference. Valid once clarification is done (or
    /// being force-ended); each phase persists before and after its work, so
    /// an interrupted `advance` picks up where it stopped.
    pub async fn advance(&mut self) -> Result<ArtifactRef, WorkflowError> {
        let result = self.advance_inner().await;
        if let Err(err) = &result {
            self.handle_failure(err);
        }
        result
    }

    async fn advance_inner(&mut self) -> Result<ArtifactRef, WorkflowError> {
        loop {
            match self.state.phase {
                WorkflowPhase::Clarifying | WorkflowPhase::Snapshotting => {
                    self.run_snapshot().await?
                }
                WorkflowPhase::Drafting => self.run_draft().await?,
                WorkflowPhase::Reviewing => self.run_review_round().await?,
                WorkflowPhase::Revising => self.run_revise_round().await?,
                WorkflowPhase::Completed => {
                    return self.state.final_ref.clone().ok_or_else(|| {
                        WorkflowError::storage_msg("completed state has no final artifact")
                    });
                }
                WorkflowPhase::Idle | WorkflowPhase::Preflight => {
                    return Err(WorkflowError::BadRequest(
                        "workflow not started; call start first".into(),
                    ));
                }
                WorkflowPhase::Error => {
                    return Err(WorkflowError::BadRequest(
                        "workflow is in error; use retry_from or reset".into(),
                    ));
                }
            }
        }
    }

    /// Re-enter `phase` after a failure. Clears the recorded error; the phase
    /// procedure itself redoes only work that was never committed.
    pub fn retry_from(&mut self, phase: WorkflowPhase) -> Result<(), WorkflowError> {
        if self.state.phase != WorkflowPhase::Error {
            return Err(WorkflowError::BadRequest(
                "retry_from only applies to a failed workflow".into(),
            ));
        }
        self.machine.transition(phase)?;
        self.state.phase = phase;
        self.state.last_error = None;
        self.save_state()
    }

    /// Throw away a failed run and return to `idle` with a fresh state for
    /// the same idea. Only legal from `error`.
    pub fn reset(&mut self) -> Result<(), WorkflowError> {
        self.machine.transition(WorkflowPhase::Idle)?;
        let idea = self.state.idea.clone();
        self.state = WorkflowState::new(idea);
        self.transcript = Transcript::new();
        self.store.save_transcript(&self.transcript)?;
        self.save_state()
    }

    // ---- phase procedures ----

    async fn run_preflight(&mut self) -> Result<(), WorkflowError> {
        self.enter_phase(WorkflowPhase::Preflight)?;
        self.emit(WorkflowEvent::PhaseStarted {
            phase: WorkflowPhase::Preflight,
        });

        for model in self.config.preflight_models() {
            let gateway = Arc::clone(&self.gateway);
            let policy = self.preflight_retry.clone();
            let probe_model = model.clone();
            let abort_rx = self.abort_rx.clone();

            let probed = with_abort(abort_rx, async move {
                policy
                    .execute(|| {
                        let gateway = Arc::clone(&gateway);
                        let model = probe_model.clone();
                        async move { gateway.test_reachable(&model).await }
                    })
                    .await
                    .map_err(WorkflowError::from)
            })
            .await;

            match probed {
                Ok(()) => {
                    info!(%model, "model reachable");
                    self.emit(WorkflowEvent::ModelProbed {
                        model: model.clone(),
                        reachable: true,
                    });
                }
                Err(WorkflowError::Aborted) => return Err(WorkflowError::Aborted),
                Err(err) => {
                    warn!(%model, error = %err, "model unreachable");
                    self.emit(WorkflowEvent::ModelProbed {
                        model: model.clone(),
                        reachable: false,
                    });
                    return Err(WorkflowError::Unreachable { model });
                }
            }
        }

        self.emit(WorkflowEvent::PhaseCompleted {
            phase: WorkflowPhase::Preflight,
        });
        Ok(())
    }

    async fn run_snapshot(&mut self) -> Result<(), WorkflowError> {
        self.enter_phase(WorkflowPhase::Snapshotting)?;
        self.emit(WorkflowEvent::PhaseStarted {
            phase: WorkflowPhase::Snapshotting,
        });

        let transcript_text = self.transcript.as_plain_text();
        let prompt = prompts::snapshot_prompt(&self.state.idea, &transcript_text);
        let snapshot = self.writer_call(vec![ChatMessage::user(prompt)]).await?;

        let snapshot_ref = self.store.commit_artifact("snapshot.md", &snapshot)?;
        self.emit(WorkflowEvent::ArtifactCommitted {
            reference: snapshot_ref.clone(),
            version: None,
        });
        let transcript_ref = self.store.commit_artifact("transcript.md", &transcript_text)?;
        self.emit(WorkflowEvent::ArtifactCommitted {
            reference: transcript_ref.clone(),
            version: None,
        });

        self.state.snapshot_ref = Some(snapshot_ref);
        self.state.transcript_ref = Some(transcript_ref);
        self.enter_phase(WorkflowPhase::Drafting)?;
        self.emit(WorkflowEvent::PhaseCompleted {
            phase: WorkflowPhase::Snapshotting,
        });
        Ok(())
    }

    async fn run_draft(&mut self) -> Result<(), WorkflowError> {
        self.enter_phase(WorkflowPhase::Drafting)?;
        self.emit(WorkflowEvent::PhaseStarted {
            phase: WorkflowPhase::Drafting,
        });

        let snapshot_ref = self
            .state
            .snapshot_ref
            .clone()
            .ok_or_else(|| WorkflowError::storage_msg("drafting without a committed snapshot"))?;
        let snapshot = self.store.read_artifact(&snapshot_ref)?;
        let prompt = prompts::draft_prompt(
            &self.state.idea,
            &snapshot,
            &self.transcript.as_plain_text(),
        );
        let draft = self.writer_call(vec![ChatMessage::user(prompt)]).await?;

        let draft_ref = self.store.commit_artifact("draft-v1.md", &draft)?;
        self.emit(WorkflowEvent::ArtifactCommitted {
            reference: draft_ref.clone(),
            version: Some(1),
        });

        self.state.draft_ref = Some(draft_ref);
        self.state.latest_artifact_version = 1;
        self.enter_phase(WorkflowPhase::Reviewing)?;
        self.emit(WorkflowEvent::PhaseCompleted {
            phase: WorkflowPhase::Drafting,
        });
        Ok(())
    }

    async fn run_review_round(&mut self) -> Result<(), WorkflowError> {
        self.enter_phase(WorkflowPhase::Reviewing)?;
        if self.state.current_round == 0 {
            self.state.current_round = 1;
        }
        let round = self.state.current_round;
        let models = self.config.reviewer_models.clone();
        self.state
            .rounds
            .entry(round)
            .or_insert_with(|| RoundState::for_reviewers(models.iter().map(String::as_str)));
        self.save_state()?;

        self.emit(WorkflowEvent::PhaseStarted {
            phase: WorkflowPhase::Reviewing,
        });

        // Only reviewers without a committed slot run; completed slots from a
        // previous partial round are kept as-is. Submission order follows the
        // configured model list, not the map's key order.
        let pending: Vec<String> = {
            let round_state = self
                .state
                .rounds
                .get(&round)
                .ok_or_else(|| WorkflowError::storage_msg("review round state missing"))?;
            models
                .iter()
                .filter(|m| {
                    round_state
                        .reviewers
                        .get(*m)
                        .is_none_or(|slot| slot.status != ReviewerStatus::Complete)
                })
                .cloned()
                .collect()
        };
        self.emit(WorkflowEvent::RoundStarted {
            round,
            pending: pending.clone(),
        });

        let snapshot_ref = self
            .state
            .snapshot_ref
            .clone()
            .ok_or_else(|| WorkflowError::storage_msg("reviewing without a committed snapshot"))?;
        let snapshot = self.store.read_artifact(&snapshot_ref)?;
        let artifact_ref = self
            .state
            .current_artifact_ref()
            .cloned()
            .ok_or_else(|| WorkflowError::storage_msg("reviewing without a committed draft"))?;
        let artifact = self.store.read_artifact(&artifact_ref)?;
        let prompt = prompts::review_prompt(&snapshot, &artifact);

        let mut tasks = Vec::with_capacity(pending.len());
        for model in &pending {
            self.emit(WorkflowEvent::ReviewerStarted {
                round,
                model: model.clone(),
            });
            let gateway = Arc::clone(&self.gateway);
            let policy = self.review_retry.clone();
            let model = model.clone();
            let messages = vec![ChatMessage::user(prompt.clone())];
            tasks.push(async move {
                let started = std::time::Instant::now();
                let result = policy
                    .execute(|| {
                        let gateway = Arc::clone(&gateway);
                        let model = model.clone();
                        let messages = messages.clone();
                        async move { gateway.complete(&model, &messages).await }
                    })
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(text) => Ok(ReviewSuccess { text, duration_ms }),
                    Err(error) => Err(ReviewFailure { error, duration_ms }),
                }
            });
        }

        let limit = self.config.max_concurrent_reviews;
        let abort_rx = self.abort_rx.clone();
        let outcomes = with_abort(abort_rx, async move {
            run_limited(tasks, limit).await.map_err(WorkflowError::from)
        })
        .await?;

        for (model, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Ok(success) => {
                    let name = format!("round-{round}-review-{}.md", sanitize_model_id(model));
                    let reference = self.store.commit_artifact(&name, &success.text)?;
                    self.emit(WorkflowEvent::ArtifactCommitted {
                        reference: reference.clone(),
                        version: None,
                    });
                    self.emit(WorkflowEvent::ReviewerFinished {
                        round,
                        model: model.clone(),
                        success: true,
                        duration_ms: success.duration_ms,
                    });
                    if let Some(rs) = self.state.rounds.get_mut(&round) {
                        rs.reviewers.insert(
                            model.clone(),
                            ReviewerSlot::complete(reference, success.duration_ms),
                        );
                    }
                }
                Err(failure) => {
                    warn!(%model, round, error = %failure.error, "reviewer failed");
                    self.emit(WorkflowEvent::ReviewerFinished {
                        round,
                        model: model.clone(),
                        success: false,
                        duration_ms: failure.duration_ms,
                    });
                    if let Some(rs) = self.state.rounds.get_mut(&round) {
                        rs.reviewers.insert(
                            model.clone(),
                            ReviewerSlot::failed(failure.error.to_string(), failure.duration_ms),
                        );
                    }
                }
            }
        }
        // Slots are persisted only after their artifacts are on disk.
        self.save_state()?;

        let round_state = self
            .state
            .rounds
            .get(&round)
            .ok_or_else(|| WorkflowError::storage_msg("review round state missing"))?;
        if !round_state.is_successful() {
            return Err(WorkflowError::RoundFailure {
                round,
                failed: round_state.failed_reviewers(),
            });
        }

        // Aggregate in configured reviewer order, not completion order.
        let sections: Vec<(String, ArtifactRef, u64)> = models
            .iter()
            .map(|model| {
                let slot = round_state.reviewers.get(model).ok_or_else(|| {
                    WorkflowError::storage_msg(format!("reviewer slot missing for {model}"))
                })?;
                let reference = slot.artifact_ref.clone().ok_or_else(|| {
                    WorkflowError::storage_msg(format!("completed reviewer {model} has no artifact"))
                })?;
                Ok((model.clone(), reference, slot.duration_ms.unwrap_or(0)))
            })
            .collect::<Result<_, WorkflowError>>()?;

        let mut bundle = String::new();
        for (model, reference, duration_ms) in &sections {
            let text = self.store.read_artifact(reference)?;
            bundle.push_str(&prompts::aggregate_section(model, *duration_ms, &text));
            bundle.push('\n');
        }
        let aggregate_ref = self
            .store
            .commit_artifact(&format!("round-{round}-feedback.md"), &bundle)?;
        self.emit(WorkflowEvent::ArtifactCommitted {
            reference: aggregate_ref.clone(),
            version: None,
        });
        if let Some(rs) = self.state.rounds.get_mut(&round) {
            rs.aggregate_ref = Some(aggregate_ref);
        }

        self.enter_phase(WorkflowPhase::Revising)?;
        self.emit(WorkflowEvent::RoundCompleted { round });
        self.emit(WorkflowEvent::PhaseCompleted {
            phase: WorkflowPhase::Reviewing,
        });
        Ok(())
    }

    async fn run_revise_round(&mut self) -> Result<(), WorkflowError> {
        self.enter_phase(WorkflowPhase::Revising)?;
        self.emit(WorkflowEvent::PhaseStarted {
            phase: WorkflowPhase::Revising,
        });

        let round = self.state.current_round.max(1);
        let snapshot_ref = self
            .state
            .snapshot_ref
            .clone()
            .ok_or_else(|| WorkflowError::storage_msg("revising without a committed snapshot"))?;
        let snapshot = self.store.read_artifact(&snapshot_ref)?;
        let artifact_ref = self
            .state
            .current_artifact_ref()
            .cloned()
            .ok_or_else(|| WorkflowError::storage_msg("revising without a committed draft"))?;
        let artifact = self.store.read_artifact(&artifact_ref)?;
        let aggregate_ref = self
            .state
            .rounds
            .get(&round)
            .and_then(|r| r.aggregate_ref.clone())
            .ok_or_else(|| {
                WorkflowError::storage_msg("revising without this round's feedback bundle")
            })?;
        let feedback = self.store.read_artifact(&aggregate_ref)?;

        let prompt = prompts::revise_prompt(&snapshot, &artifact, &feedback);
        let revised = self.writer_call(vec![ChatMessage::user(prompt)]).await?;

        let version = self.state.latest_artifact_version + 1;
        let reference = self
            .store
            .commit_artifact(&format!("revision-v{version}.md"), &revised)?;
        self.emit(WorkflowEvent::ArtifactCommitted {
            reference: reference.clone(),
            version: Some(version),
        });
        if let Some(rs) = self.state.rounds.get_mut(&round) {
            rs.revised_artifact_ref = Some(reference);
        }
        self.state.latest_artifact_version = version;

        if round >= self.config.review_rounds {
            let final_ref = self.store.commit_artifact("final.md", &revised)?;
            self.state.final_ref = Some(final_ref.clone());
            self.enter_phase(WorkflowPhase::Completed)?;
            self.emit(WorkflowEvent::WorkflowCompleted { final_ref, version });
        } else {
            self.state.current_round = round + 1;
            self.state.rounds.insert(
                round + 1,
                RoundState::for_reviewers(self.config.reviewer_models.iter().map(String::as_str)),
            );
            self.enter_phase(WorkflowPhase::Reviewing)?;
        }
        self.emit(WorkflowEvent::PhaseCompleted {
            phase: WorkflowPhase::Revising,
        });
        Ok(())
    }

    // ---- plumbing ----

    /// Transition machine and state to `to` and persist. A no-op transition
    /// (already there, as on resume) only refreshes the persisted state.
    fn enter_phase(&mut self, to: WorkflowPhase) -> Result<(), WorkflowError> {
        if self.machine.current() != to {
            self.machine.transition(to)?;
        }
        self.state.phase = to;
        self.save_state()
    }

    fn save_state(&mut self) -> Result<(), WorkflowError> {
        self.state.updated_at = Utc::now();
        self.store.save_state(&self.state)
    }

    /// Record a failure and move to `error`. Abort and caller-usage errors
    /// pass through without touching the persisted state.
    fn handle_failure(&mut self, err: &WorkflowError) {
        if matches!(
            err,
            WorkflowError::Aborted | WorkflowError::BadRequest(_)
        ) {
            return;
        }
        let phase = self.state.phase;
        let model = err.model_id().map(str::to_string);
        error!(%phase, error = %err, "workflow failed");

        if self.machine.can_transition(WorkflowPhase::Error) {
            let _ = self.machine.transition(WorkflowPhase::Error);
        }
        self.state.record_error(phase, &err.to_string(), model.as_deref());
        if let Err(save_err) = self.save_state() {
            warn!(error = %save_err, "failed to persist error state");
        }
        self.emit(WorkflowEvent::WorkflowFailed {
            phase,
            message: err.to_string(),
            model,
        });
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// One buffered writer completion under the writer retry policy.
    async fn writer_call(&self, messages: Vec<ChatMessage>) -> Result<String, WorkflowError> {
        let gateway = Arc::clone(&self.gateway);
        let model = self.config.writer_model.clone();
        let policy = self.writer_retry.clone();
        let abort_rx = self.abort_rx.clone();

        with_abort(abort_rx, async move {
            policy
                .execute(|| {
                    let gateway = Arc::clone(&gateway);
                    let model = model.clone();
                    let messages = messages.clone();
                    async move { gateway.complete(&model, &messages).await }
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await
    }

    /// One streamed writer completion. Fragments are forwarded as display
    /// events; only the fully-accumulated text is returned. A stream that
    /// fails mid-flight discards everything received and retries whole.
    async fn writer_call_streaming(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<String, WorkflowError> {
        let gateway = Arc::clone(&self.gateway);
        let model = self.config.writer_model.clone();
        let policy = self.writer_retry.clone();
        let event_tx = self.event_tx.clone();
        let abort_rx = self.abort_rx.clone();

        with_abort(abort_rx, async move {
            policy
                .execute(|| {
                    let gateway = Arc::clone(&gateway);
                    let model = model.clone();
                    let messages = messages.clone();
                    let event_tx = event_tx.clone();
                    async move {
                        let mut stream = gateway.complete_streaming(&model, &messages).await?;
                        let mut full = String::new();
                        while let Some(fragment) = stream.next().await {
                            let fragment = fragment?;
                            if let Some(tx) = &event_tx {
                                let _ = tx.send(WorkflowEvent::WriterFragment {
                                    text: fragment.clone(),
                                });
                            }
                            full.push_str(&fragment);
                        }
                        Ok(full)
                    }
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await
    }
}

/// Model ids may contain path separators (`vendor/model:tag`); keep artifact
/// names flat.
fn sanitize_model_id(model: &str) -> String {
    model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Race `fut` against the abort flag. Dropping `fut` on abort cancels any
/// work it owns; nothing committed is undone.
async fn with_abort<T, F>(
    mut abort_rx: watch::Receiver<bool>,
    fut: F,
) -> Result<T, WorkflowError>
where
    F: Future<Output = Result<T, WorkflowError>>,
{
    tokio::select! {
        biased;
        _ = wait_for_abort(&mut abort_rx) => Err(WorkflowError::Aborted),
        result = fut => result,
    }
}

async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone means nobody can abort any more.
            std::future::pending::<()>().await;
        }
    }
}
