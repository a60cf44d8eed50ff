//! Post-delivery ("PM") conversation: turn-based chat plus action affordances.
//!
//! Available only once an iteration has completed. Every human message yields
//! exactly one reply. Overlapping sends follow [`OverlapPolicy`]; they are
//! never dispatched concurrently. A `goto_stage` action is destructive and
//! needs a separate confirmation before anything is dispatched.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::stage::StageKey;
use crate::core::types::{IterationStatus, PmReply, PmRole, PmTurn};

/// An affordance proposed by the PM agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum PmAction {
    /// Restart the iteration at `target_stage`, discarding later stages.
    GotoStage { target_stage: StageKey },
    /// Open the ordinary creation flow for a follow-up iteration.
    CreateIteration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_stage: Option<StageKey>,
    },
}

/// What to do with a send while another turn is outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Refuse the new message.
    #[default]
    Reject,
    /// Hold it and dispatch after the outstanding turn finishes.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmError {
    #[error("post-delivery chat requires a completed iteration (status is {0:?})")]
    NotAvailable(IterationStatus),
    #[error("message is empty")]
    EmptyMessage,
    #[error("a message is already being processed")]
    Busy,
    #[error("no stage change is awaiting confirmation")]
    NothingToConfirm,
    #[error("turn {0} is not outstanding")]
    UnknownTurn(u64),
}

/// A turn ready to be sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmRequest {
    pub turn_id: u64,
    pub message: String,
    /// Conversation before `message`, oldest first.
    pub history: Vec<PmTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    Dispatch(PmRequest),
    Queued { position: usize },
}

/// Result of asking to apply a [`PmAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionDecision {
    /// A goto is parked until [`PmSession::confirm_goto`]; `prompt` describes it.
    NeedsConfirmation { target_stage: StageKey, prompt: String },
    /// Hand off to the normal iteration creation flow.
    CreateIteration,
}

/// Serializable view of the PM conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PmView {
    pub turns: Vec<PmTurn>,
    pub busy: bool,
    pub queued: usize,
    pub pending_goto: Option<StageKey>,
}

#[derive(Debug, Clone, Default)]
pub struct PmSession {
    policy: OverlapPolicy,
    turns: Vec<PmTurn>,
    outstanding: Option<u64>,
    queue: VecDeque<String>,
    pending_goto: Option<StageKey>,
    next_turn_id: u64,
}

impl PmSession {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn pending_goto(&self) -> Option<StageKey> {
        self.pending_goto
    }

    pub fn turns(&self) -> &[PmTurn] {
        &self.turns
    }

    pub fn view(&self) -> PmView {
        PmView {
            turns: self.turns.clone(),
            busy: self.is_busy(),
            queued: self.queue.len(),
            pending_goto: self.pending_goto,
        }
    }

    /// Start a turn, or queue/reject it if one is outstanding.
    pub fn begin_send(
        &mut self,
        message: &str,
        status: IterationStatus,
    ) -> Result<SendDecision, PmError> {
        if status != IterationStatus::Completed {
            return Err(PmError::NotAvailable(status));
        }
        let message = message.trim();
        if message.is_empty() {
            return Err(PmError::EmptyMessage);
        }
        if self.is_busy() {
            return match self.policy {
                OverlapPolicy::Reject => Err(PmError::Busy),
                OverlapPolicy::Queue => {
                    self.queue.push_back(message.to_string());
                    Ok(SendDecision::Queued {
                        position: self.queue.len(),
                    })
                }
            };
        }
        Ok(SendDecision::Dispatch(self.start_turn(message.to_string())))
    }

    /// Finish the outstanding turn. Returns the next queued turn, if any.
    pub fn finish(
        &mut self,
        turn_id: u64,
        reply: Option<&PmReply>,
    ) -> Result<Option<PmRequest>, PmError> {
        if self.outstanding != Some(turn_id) {
            return Err(PmError::UnknownTurn(turn_id));
        }
        self.outstanding = None;
        match reply {
            Some(reply) => self.turns.push(PmTurn {
                role: PmRole::Assistant,
                content: reply.message.clone(),
            }),
            // The unanswered user turn stays out of the history sent next time.
            None => {
                self.turns.pop();
            }
        }
        Ok(self.queue.pop_front().map(|message| self.start_turn(message)))
    }

    /// Drop every queued message. Returns how many were dropped.
    pub fn discard_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn request_action(&mut self, action: &PmAction) -> ActionDecision {
        match action {
            PmAction::GotoStage { target_stage } => {
                self.pending_goto = Some(*target_stage);
                ActionDecision::NeedsConfirmation {
                    target_stage: *target_stage,
                    prompt: goto_prompt(*target_stage),
                }
            }
            PmAction::CreateIteration { .. } => ActionDecision::CreateIteration,
        }
    }

    pub fn confirm_goto(&mut self) -> Result<StageKey, PmError> {
        self.pending_goto.take().ok_or(PmError::NothingToConfirm)
    }

    pub fn cancel_goto(&mut self) -> Result<StageKey, PmError> {
        self.pending_goto.take().ok_or(PmError::NothingToConfirm)
    }

    fn start_turn(&mut self, message: String) -> PmRequest {
        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        let history = self.turns.clone();
        self.turns.push(PmTurn {
            role: PmRole::User,
            content: message.clone(),
        });
        self.outstanding = Some(turn_id);
        PmRequest {
            turn_id,
            message,
            history,
        }
    }
}

fn goto_prompt(target: StageKey) -> String {
    let discarded: Vec<&str> = StageKey::ALL[target.index() + 1..]
        .iter()
        .map(|stage| stage.display_name())
        .collect();
    if discarded.is_empty() {
        format!("Return to the {} stage and run it again?", target.display_name())
    } else {
        format!(
            "Return to the {} stage? Output from {} will be discarded.",
            target.display_name(),
            discarded.join(", ")
        )
    }
}
