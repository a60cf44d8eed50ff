//! Iteration lifecycle state machine.
//!
//! ```text
//! Draft --execute--> Running --completed--> Completed --restart_from--> Running
//!                     |   ^                                               ^
//!                  failed |continue/retry                                 |
//!                     v   |                                               |
//!                    Failed ----------------restart_from-----------------+
//! Paused (resync only) --continue/retry/restart_from--> Running
//! ```
//!
//! The machine is a pure value transformer. Callers own persistence,
//! transcript resets, and request cancellation; [`Transition`] tells them
//! which of those the step requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::invariants::validate_iteration;
use crate::core::stage::StageKey;
use crate::core::types::{InheritanceMode, IterationStatus, NewIteration};

/// One execution attempt of the seven-stage pipeline within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub project_id: String,
    /// Unique and monotonic per project.
    pub sequence: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Weak lineage reference; the base may be deleted later.
    #[serde(default)]
    pub base_iteration_id: Option<String>,
    #[serde(default)]
    pub inheritance_mode: InheritanceMode,
    pub status: IterationStatus,
    #[serde(default)]
    pub current_stage: Option<StageKey>,
    /// Completion order, no duplicates.
    #[serde(default)]
    pub completed_stages: Vec<StageKey>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Inputs to the lifecycle machine.
///
/// `Execute`, `Continue`, `Retry` and `RestartFrom` are human commands;
/// the rest come from the engine's envelope stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Execute,
    Continue,
    Retry,
    RestartFrom(StageKey),
    Started,
    Continued,
    StageStarted(StageKey),
    Completed,
    Failed(String),
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Execute => "execute",
            LifecycleEvent::Continue => "continue",
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::RestartFrom(_) => "restart_from",
            LifecycleEvent::Started => "iteration_started",
            LifecycleEvent::Continued => "iteration_continued",
            LifecycleEvent::StageStarted(_) => "stage_started",
            LifecycleEvent::Completed => "iteration_completed",
            LifecycleEvent::Failed(_) => "iteration_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot apply {event} while iteration is {status:?}")]
    InvalidTransition {
        event: &'static str,
        status: IterationStatus,
    },
    #[error("stage {to} would move progress back from {from}")]
    StageRegression { from: StageKey, to: StageKey },
    #[error("cannot delete an iteration while it is running")]
    DeleteWhileRunning,
}

/// Side effects a committed transition requires of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: IterationStatus,
    pub to: IterationStatus,
    /// A fresh run starts with an empty transcript.
    pub reset_transcript: bool,
    /// Any pending input request is void; the engine discarded its id.
    pub cancel_request: bool,
    /// False for idempotent confirmations.
    pub changed: bool,
}

impl Transition {
    fn confirm(status: IterationStatus) -> Self {
        Self {
            from: status,
            to: status,
            reset_transcript: false,
            cancel_request: false,
            changed: false,
        }
    }
}

impl Iteration {
    /// A fresh Draft iteration.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        sequence: u32,
        form: NewIteration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            sequence,
            title: form.title,
            description: form.description,
            base_iteration_id: form.base_iteration_id,
            inheritance_mode: form.inheritance_mode,
            status: IterationStatus::Draft,
            current_stage: None,
            completed_stages: Vec::new(),
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == IterationStatus::Running
    }

    /// Apply one event. On error the iteration is unchanged.
    pub fn transition(
        &mut self,
        event: &LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, LifecycleError> {
        use IterationStatus as S;

        let from = self.status;
        let invalid = || LifecycleError::InvalidTransition {
            event: event.name(),
            status: from,
        };

        let mut step = Transition {
            from,
            to: S::Running,
            reset_transcript: false,
            cancel_request: false,
            changed: true,
        };

        match (event, from) {
            (LifecycleEvent::Execute | LifecycleEvent::Started, S::Draft) => {
                self.status = S::Running;
                self.current_stage = Some(StageKey::first());
                self.completed_stages.clear();
                self.error = None;
                self.started_at = Some(now);
                self.completed_at = None;
                step.reset_transcript = true;
                step.cancel_request = true;
            }
            (LifecycleEvent::Started | LifecycleEvent::Continued, S::Running) => {
                return Ok(Transition::confirm(from));
            }
            (
                LifecycleEvent::Continue | LifecycleEvent::Retry | LifecycleEvent::Continued,
                S::Paused | S::Failed,
            ) => {
                self.status = S::Running;
                if self.current_stage.is_none() {
                    self.current_stage = Some(self.first_incomplete_stage());
                }
                self.error = None;
            }
            (LifecycleEvent::RestartFrom(stage), S::Completed | S::Failed | S::Paused) => {
                self.status = S::Running;
                self.current_stage = Some(*stage);
                self.completed_stages.retain(|done| done < stage);
                self.error = None;
                self.completed_at = None;
                step.cancel_request = true;
            }
            (LifecycleEvent::StageStarted(stage), S::Running) => {
                let Some(current) = self.current_stage else {
                    self.current_stage = Some(*stage);
                    return Ok(step);
                };
                if *stage < current {
                    return Err(LifecycleError::StageRegression {
                        from: current,
                        to: *stage,
                    });
                }
                if *stage == current {
                    return Ok(Transition::confirm(from));
                }
                self.mark_completed(current);
                self.current_stage = Some(*stage);
            }
            (LifecycleEvent::Completed, S::Running | S::Paused) => {
                self.status = S::Completed;
                self.current_stage = None;
                for stage in StageKey::ALL {
                    self.mark_completed(stage);
                }
                self.error = None;
                self.completed_at = Some(now);
                step.to = S::Completed;
                step.cancel_request = true;
            }
            (LifecycleEvent::Failed(error), S::Running | S::Paused) => {
                self.status = S::Failed;
                self.error = Some(error.clone());
                step.to = S::Failed;
                step.cancel_request = true;
            }
            _ => return Err(invalid()),
        }
        Ok(step)
    }

    /// Stages shown as done: completed ones plus everything before the
    /// current stage, in stage order.
    pub fn displayed_completed_stages(&self) -> Vec<StageKey> {
        StageKey::ALL
            .into_iter()
            .filter(|stage| {
                self.completed_stages.contains(stage)
                    || self.current_stage.is_some_and(|current| *stage < current)
            })
            .collect()
    }

    /// Percent of stages done, rounded. Same formula in every status.
    pub fn progress_percent(&self) -> u8 {
        let done = self.displayed_completed_stages().len() as f64;
        (done * 100.0 / StageKey::COUNT as f64).round() as u8
    }

    pub fn check_deletable(&self) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::DeleteWhileRunning);
        }
        Ok(())
    }

    /// Every violated invariant, empty when consistent.
    pub fn validate(&self) -> Vec<String> {
        validate_iteration(self)
    }

    fn mark_completed(&mut self, stage: StageKey) {
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
    }

    fn first_incomplete_stage(&self) -> StageKey {
        StageKey::ALL
            .into_iter()
            .find(|stage| !self.completed_stages.contains(stage))
            .unwrap_or(StageKey::Delivery)
    }
}
