//! `SessionState`: one iteration's transcript, lifecycle, input request and
//! post-delivery chat, mutated serially.
//!
//! Every mutation returns the [`Effect`]s the owner must carry out. Outbound
//! commands get a ticket; their outcome is fed back through
//! [`SessionState::command_finished`], which settles or rolls back whatever
//! the command applied optimistically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::envelope::{Command, Envelope};
use crate::core::input_request::{
    CoordinatorError, DEFAULT_FEEDBACK_PROMPT, Echo, InputCoordinator, InputRequest,
    InputRequestView, OptionIds, Resolution, Selection,
};
use crate::core::lifecycle::{Iteration, LifecycleError, LifecycleEvent, Transition};
use crate::core::pm::{
    ActionDecision, OverlapPolicy, PmAction, PmError, PmRequest, PmSession, PmView, SendDecision,
};
use crate::core::stage::{StageKey, detect_stage_start};
use crate::core::transcript::{Transcript, TranscriptError};
use crate::core::types::{CommandOutcome, CommandReply, IterationStatus, PmReply};

/// Per-session knobs, usually taken from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub pm_overlap: OverlapPolicy,
    pub option_ids: OptionIds,
    pub feedback_prompt: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pm_overlap: OverlapPolicy::default(),
            option_ids: OptionIds::default(),
            feedback_prompt: DEFAULT_FEEDBACK_PROMPT.to_string(),
        }
    }
}

/// Something the human asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Execute,
    Continue,
    Retry,
    SelectOption { request_id: String, option_id: String },
    SubmitFeedback { request_id: String, text: String },
    CancelFeedback { request_id: String },
    RespondText { request_id: String, text: String },
    ToggleThinking { index: usize },
    SendPmMessage { message: String },
    ApplyPmAction { action: PmAction },
    ConfirmGoto,
    CancelGoto,
}

impl UserAction {
    pub fn name(&self) -> &'static str {
        match self {
            UserAction::Execute => "execute",
            UserAction::Continue => "continue",
            UserAction::Retry => "retry",
            UserAction::SelectOption { .. } => "select_option",
            UserAction::SubmitFeedback { .. } => "submit_feedback",
            UserAction::CancelFeedback { .. } => "cancel_feedback",
            UserAction::RespondText { .. } => "respond_text",
            UserAction::ToggleThinking { .. } => "toggle_thinking",
            UserAction::SendPmMessage { .. } => "send_pm_message",
            UserAction::ApplyPmAction { .. } => "apply_pm_action",
            UserAction::ConfirmGoto => "confirm_goto",
            UserAction::CancelGoto => "cancel_goto",
        }
    }

    /// Actions that make the iteration Running when they succeed.
    pub fn starts_run(&self) -> bool {
        matches!(
            self,
            UserAction::Execute | UserAction::Continue | UserAction::Retry | UserAction::ConfirmGoto
        )
    }
}

/// Work the session owner must perform after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send `command`; report back with [`SessionState::command_finished`].
    Dispatch { ticket: u64, command: Command },
    /// Switch the external view to the named artifact.
    ShowArtifact { artifact_type: String },
    /// Open the iteration creation flow based on this iteration.
    CreateIteration { base_iteration_id: String },
    /// The project's iteration list is stale.
    RefreshIterations,
    /// The project was reloaded; rebuild every session from the store.
    Resync,
}

/// Immediate answer to a [`UserAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReply {
    /// A command went out; its result arrives under `ticket`.
    Dispatched { ticket: u64 },
    Queued { position: usize },
    ViewArtifact { artifact_type: String },
    FeedbackRequested,
    FeedbackCancelled,
    NeedsConfirmation { target_stage: StageKey, prompt: String },
    GotoCancelled { target_stage: StageKey },
    CreateIteration,
    Expanded(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub reply: ActionReply,
    pub effects: Vec<Effect>,
}

impl Handled {
    fn reply(reply: ActionReply) -> Self {
        Self {
            reply,
            effects: Vec::new(),
        }
    }

    fn dispatch(ticket: u64, command: Command) -> Self {
        Self {
            reply: ActionReply::Dispatched { ticket },
            effects: vec![Effect::Dispatch { ticket, command }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Pm(#[from] PmError),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}

/// Serializable read model published after every committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub iteration: Iteration,
    pub progress_percent: u8,
    pub displayed_completed_stages: Vec<StageKey>,
    pub transcript: Transcript,
    pub input_request: Option<InputRequestView>,
    pub pm: PmView,
    /// A user command was applied but not yet confirmed.
    pub tentative: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct Rollback {
    iteration: Iteration,
    /// Only kept when the command reset the transcript.
    transcript: Option<Transcript>,
    /// Request the command cancelled, if any.
    request: Option<InputRequest>,
    run_epoch: u64,
}

#[derive(Debug, Clone)]
enum Pending {
    Lifecycle {
        command: &'static str,
        /// Cleared once an envelope confirms or supersedes the change.
        rollback: Option<Box<Rollback>>,
    },
    Response {
        request: InputRequest,
        /// Run the request belonged to; a restore across runs is refused.
        run_epoch: u64,
    },
    Pm {
        turn_id: u64,
    },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    iteration: Iteration,
    transcript: Transcript,
    coordinator: InputCoordinator,
    pm: PmSession,
    pending: BTreeMap<u64, Pending>,
    next_ticket: u64,
    /// Bumped by every transition that cancels the input request.
    run_epoch: u64,
    last_error: Option<String>,
}

impl SessionState {
    pub fn new(iteration: Iteration, options: &SessionOptions) -> Self {
        Self::with_transcript(iteration, Transcript::new(), options)
    }

    /// Rebuild a session from stored state.
    pub fn with_transcript(
        iteration: Iteration,
        transcript: Transcript,
        options: &SessionOptions,
    ) -> Self {
        Self {
            iteration,
            transcript,
            coordinator: InputCoordinator::new(
                options.option_ids.clone(),
                options.feedback_prompt.clone(),
            ),
            pm: PmSession::new(options.pm_overlap),
            pending: BTreeMap::new(),
            next_ticket: 0,
            run_epoch: 0,
            last_error: None,
        }
    }

    pub fn iteration(&self) -> &Iteration {
        &self.iteration
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn coordinator(&self) -> &InputCoordinator {
        &self.coordinator
    }

    pub fn pm(&self) -> &PmSession {
        &self.pm
    }

    pub fn is_tentative(&self) -> bool {
        self.pending.values().any(|pending| {
            matches!(
                pending,
                Pending::Lifecycle {
                    rollback: Some(_),
                    ..
                }
            )
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            iteration: self.iteration.clone(),
            progress_percent: self.iteration.progress_percent(),
            displayed_completed_stages: self.iteration.displayed_completed_stages(),
            transcript: self.transcript.clone(),
            input_request: self.coordinator.view(),
            pm: self.pm.view(),
            tentative: self.is_tentative(),
            last_error: self.last_error.clone(),
        }
    }

    /// Fold one inbound envelope. Protocol violations are logged and dropped.
    pub fn apply_envelope(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(target) = envelope.lifecycle_iteration()
            && target != self.iteration.id
        {
            warn!(
                iteration = %self.iteration.id,
                routed_to = target,
                event = envelope.name(),
                "lifecycle envelope for another iteration; dropped"
            );
            return effects;
        }

        match envelope {
            Envelope::IterationStarted { .. } => {
                self.apply_lifecycle(&LifecycleEvent::Started, now);
            }
            Envelope::IterationContinued { .. } => {
                self.apply_lifecycle(&LifecycleEvent::Continued, now);
            }
            Envelope::IterationCompleted { .. } => {
                self.apply_lifecycle(&LifecycleEvent::Completed, now);
            }
            Envelope::IterationFailed { error, .. } => {
                self.apply_lifecycle(&LifecycleEvent::Failed(error.clone()), now);
            }
            Envelope::AgentEvent(content) | Envelope::AgentStreaming(content) => {
                let applied = self.transcript.apply(envelope, now);
                debug!(event = envelope.name(), agent = %content.agent_name, ?applied, "folded content");
                if !content.is_thinking()
                    && !content.is_error()
                    && let Some(stage) = detect_stage_start(&content.content)
                {
                    self.apply_lifecycle(&LifecycleEvent::StageStarted(stage), now);
                }
            }
            Envelope::ToolCall(_) | Envelope::ToolResult(_) => {
                let applied = self.transcript.apply(envelope, now);
                debug!(event = envelope.name(), ?applied, "folded tool envelope");
            }
            Envelope::InputRequest(payload) => match self.coordinator.receive(payload) {
                Ok(request) => info!(
                    request_id = %request.request_id,
                    artifact = request.artifact_type.as_deref().unwrap_or("-"),
                    "input request pending"
                ),
                Err(err) => warn!(%err, "input request rejected"),
            },
            Envelope::IterationCreated => {}
            Envelope::ProjectLoaded | Envelope::ProjectInitialized => {
                if let Some(request) = self.coordinator.force_cancel() {
                    info!(request_id = %request.request_id, "input request dropped by project reset");
                }
                effects.push(Effect::Resync);
            }
        }

        if envelope.refreshes_iteration_list() {
            effects.push(Effect::RefreshIterations);
        }
        effects
    }

    /// Handle a human action. Errors leave the state unchanged.
    pub fn handle(
        &mut self,
        action: UserAction,
        now: DateTime<Utc>,
    ) -> Result<Handled, SessionError> {
        match action {
            UserAction::Execute => {
                let command = Command::Execute {
                    iteration_id: self.iteration.id.clone(),
                };
                self.run_command(LifecycleEvent::Execute, command, now)
            }
            UserAction::Continue => {
                let command = Command::Continue {
                    iteration_id: self.iteration.id.clone(),
                };
                self.run_command(LifecycleEvent::Continue, command, now)
            }
            UserAction::Retry => {
                let command = Command::Retry {
                    iteration_id: self.iteration.id.clone(),
                };
                self.run_command(LifecycleEvent::Retry, command, now)
            }
            UserAction::SelectOption {
                request_id,
                option_id,
            } => {
                self.coordinator.check_request_id(&request_id)?;
                match self.coordinator.select(&option_id)? {
                    Selection::Resolved(resolution) => Ok(self.send_response(resolution, now)),
                    Selection::ViewArtifact { artifact_type } => Ok(Handled {
                        reply: ActionReply::ViewArtifact {
                            artifact_type: artifact_type.clone(),
                        },
                        effects: vec![Effect::ShowArtifact { artifact_type }],
                    }),
                    Selection::FeedbackRequested => {
                        Ok(Handled::reply(ActionReply::FeedbackRequested))
                    }
                }
            }
            UserAction::SubmitFeedback { request_id, text } => {
                self.coordinator.check_request_id(&request_id)?;
                let resolution = self.coordinator.submit_feedback(&text)?;
                Ok(self.send_response(resolution, now))
            }
            UserAction::CancelFeedback { request_id } => {
                self.coordinator.check_request_id(&request_id)?;
                self.coordinator.cancel_feedback()?;
                Ok(Handled::reply(ActionReply::FeedbackCancelled))
            }
            UserAction::RespondText { request_id, text } => {
                self.coordinator.check_request_id(&request_id)?;
                let resolution = self.coordinator.respond_text(&text)?;
                Ok(self.send_response(resolution, now))
            }
            UserAction::ToggleThinking { index } => {
                let expanded = self.transcript.toggle_expanded(index)?;
                Ok(Handled::reply(ActionReply::Expanded(expanded)))
            }
            UserAction::SendPmMessage { message } => {
                let decision = self.pm.begin_send(&message, self.iteration.status)?;
                self.transcript.push_user(message.trim(), now);
                match decision {
                    SendDecision::Dispatch(request) => Ok(self.dispatch_pm(request)),
                    SendDecision::Queued { position } => {
                        debug!(position, "pm message queued");
                        Ok(Handled::reply(ActionReply::Queued { position }))
                    }
                }
            }
            UserAction::ApplyPmAction { action } => {
                if self.iteration.status != IterationStatus::Completed {
                    return Err(PmError::NotAvailable(self.iteration.status).into());
                }
                match self.pm.request_action(&action) {
                    ActionDecision::NeedsConfirmation {
                        target_stage,
                        prompt,
                    } => Ok(Handled::reply(ActionReply::NeedsConfirmation {
                        target_stage,
                        prompt,
                    })),
                    ActionDecision::CreateIteration => Ok(Handled {
                        reply: ActionReply::CreateIteration,
                        effects: vec![Effect::CreateIteration {
                            base_iteration_id: self.iteration.id.clone(),
                        }],
                    }),
                }
            }
            UserAction::ConfirmGoto => {
                let target = self.pm.pending_goto().ok_or(PmError::NothingToConfirm)?;
                let command = Command::RestartFromStage {
                    iteration_id: self.iteration.id.clone(),
                    target_stage: target,
                };
                let handled = self.run_command(LifecycleEvent::RestartFrom(target), command, now)?;
                self.pm.confirm_goto()?;
                self.discard_pm_queue(now);
                Ok(handled)
            }
            UserAction::CancelGoto => {
                let target_stage = self.pm.cancel_goto()?;
                Ok(Handled::reply(ActionReply::GotoCancelled { target_stage }))
            }
        }
    }

    /// Fold the outcome of a dispatched command back into the session.
    pub fn command_finished(
        &mut self,
        ticket: u64,
        outcome: CommandOutcome,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let Some(pending) = self.pending.remove(&ticket) else {
            debug!(ticket, "outcome for unknown ticket ignored");
            return Vec::new();
        };

        match (pending, outcome) {
            (Pending::Lifecycle { .. } | Pending::Response { .. }, Ok(_)) => Vec::new(),
            (Pending::Lifecycle { command, rollback }, Err(err)) => {
                warn!(iteration = %self.iteration.id, command, %err, "command failed");
                self.last_error = Some(format!("{command} failed: {err}"));
                if let Some(rollback) = rollback {
                    self.iteration = rollback.iteration;
                    self.run_epoch = rollback.run_epoch;
                    if let Some(transcript) = rollback.transcript {
                        self.transcript = transcript;
                    }
                    if let Some(request) = rollback.request
                        && self.coordinator.reinstate(request)
                    {
                        info!("input request reinstated by rollback");
                    }
                    info!(iteration = %self.iteration.id, status = ?self.iteration.status, "tentative transition rolled back");
                }
                Vec::new()
            }
            (Pending::Response { request, run_epoch }, Err(err)) => {
                warn!(request_id = %request.request_id, %err, "response failed to send");
                self.transcript
                    .push_error(format!("Failed to send response: {err}"), now);
                self.last_error = Some(err);
                if run_epoch != self.run_epoch || self.iteration.status.is_terminal() {
                    info!(request_id = %request.request_id, "run has ended; request not restored");
                } else if self.coordinator.restore(request) {
                    info!("input request restored after failed response");
                }
                Vec::new()
            }
            (Pending::Pm { turn_id }, Ok(CommandReply::Pm(reply))) => {
                self.transcript
                    .push_pm(reply.message.clone(), reply.actions.clone(), now);
                self.finish_pm(turn_id, Some(&reply), now)
            }
            (Pending::Pm { turn_id }, Ok(CommandReply::Ack)) => {
                self.fail_pm(turn_id, "engine returned no reply".to_string(), now)
            }
            (Pending::Pm { turn_id }, Err(err)) => self.fail_pm(turn_id, err, now),
        }
    }

    fn apply_lifecycle(&mut self, event: &LifecycleEvent, now: DateTime<Utc>) -> Option<Transition> {
        match self.iteration.transition(event, now) {
            Ok(step) => {
                self.settle_tentative();
                self.after_transition(step);
                if step.changed {
                    info!(
                        iteration = %self.iteration.id,
                        event = event.name(),
                        from = ?step.from,
                        to = ?step.to,
                        stage = ?self.iteration.current_stage,
                        "lifecycle transition"
                    );
                }
                Some(step)
            }
            Err(err) => {
                warn!(iteration = %self.iteration.id, %err, "lifecycle event rejected");
                None
            }
        }
    }

    /// Returns the input request the transition cancelled, if any.
    fn after_transition(&mut self, step: Transition) -> Option<InputRequest> {
        if step.reset_transcript {
            self.transcript.clear();
        }
        let mut cancelled = None;
        if step.cancel_request {
            self.run_epoch += 1;
            cancelled = self.coordinator.force_cancel();
            if let Some(request) = &cancelled {
                info!(request_id = %request.request_id, "input request cancelled by lifecycle");
            }
        }
        if step.changed && step.to.is_terminal() {
            self.transcript.finish_streaming();
        }
        cancelled
    }

    /// Envelopes are authoritative: once one moves the lifecycle, no
    /// outstanding command may roll it back.
    fn settle_tentative(&mut self) {
        for pending in self.pending.values_mut() {
            if let Pending::Lifecycle { rollback, .. } = pending {
                *rollback = None;
            }
        }
    }

    /// Apply a human lifecycle command optimistically and dispatch it.
    fn run_command(
        &mut self,
        event: LifecycleEvent,
        command: Command,
        now: DateTime<Utc>,
    ) -> Result<Handled, SessionError> {
        let previous = self.iteration.clone();
        let run_epoch = self.run_epoch;
        let step = self.iteration.transition(&event, now)?;
        let transcript = step.reset_transcript.then(|| self.transcript.clone());
        let request = self.after_transition(step);
        self.last_error = None;

        let ticket = self.register(Pending::Lifecycle {
            command: command.name(),
            rollback: Some(Box::new(Rollback {
                iteration: previous,
                transcript,
                request,
                run_epoch,
            })),
        });
        info!(iteration = %self.iteration.id, command = command.name(), ticket, "dispatching command");
        Ok(Handled::dispatch(ticket, command))
    }

    fn send_response(&mut self, resolution: Resolution, now: DateTime<Utc>) -> Handled {
        for echo in resolution.echo {
            match echo {
                Echo::User(text) => self.transcript.push_user(text, now),
                Echo::System(text) => self.transcript.push_system(text, now),
            }
        }
        let command = Command::SubmitInputResponse {
            request_id: resolution.request.request_id.clone(),
            response: resolution.response,
            response_type: resolution.response_type,
        };
        let ticket = self.register(Pending::Response {
            request: resolution.request,
            run_epoch: self.run_epoch,
        });
        info!(ticket, "dispatching input response");
        Handled::dispatch(ticket, command)
    }

    fn dispatch_pm(&mut self, request: PmRequest) -> Handled {
        let ticket = self.register(Pending::Pm {
            turn_id: request.turn_id,
        });
        let command = Command::SendPmMessage {
            iteration_id: self.iteration.id.clone(),
            message: request.message,
            history: request.history,
        };
        info!(ticket, turn = request.turn_id, "dispatching pm message");
        Handled::dispatch(ticket, command)
    }

    /// Queued messages never outlive the Completed status they were sent in.
    fn discard_pm_queue(&mut self, now: DateTime<Utc>) {
        let dropped = self.pm.discard_queue();
        if dropped > 0 {
            info!(dropped, "queued pm messages discarded");
            self.transcript.push_system(
                format!("{dropped} queued message(s) discarded: the iteration is no longer completed"),
                now,
            );
        }
    }

    fn finish_pm(
        &mut self,
        turn_id: u64,
        reply: Option<&PmReply>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        if self.iteration.status != IterationStatus::Completed {
            self.discard_pm_queue(now);
        }
        match self.pm.finish(turn_id, reply) {
            Ok(Some(next)) => self.dispatch_pm(next).effects,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(%err, "pm turn bookkeeping out of sync");
                Vec::new()
            }
        }
    }

    fn fail_pm(&mut self, turn_id: u64, err: String, now: DateTime<Utc>) -> Vec<Effect> {
        warn!(turn = turn_id, %err, "pm message failed");
        self.transcript
            .push_error(format!("Post-delivery reply failed: {err}"), now);
        self.last_error = Some(err);
        self.finish_pm(turn_id, None, now)
    }

    fn register(&mut self, pending: Pending) -> u64 {
        self.next_ticket += 1;
        self.pending.insert(self.next_ticket, pending);
        self.next_ticket
    }
}
