//! Shared deterministic types for the session protocol.
//!
//! These types define stable contracts between core components and the
//! external collaborators. They must not depend on external state or I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::pm::PmAction;

/// Lifecycle status of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
}

impl IterationStatus {
    /// Statuses from which an iteration resumes via `continue`/`retry`.
    pub fn is_resumable(self) -> bool {
        matches!(self, IterationStatus::Paused | IterationStatus::Failed)
    }

    /// Statuses after which the engine has discarded in-flight correlation ids.
    pub fn is_terminal(self) -> bool {
        matches!(self, IterationStatus::Completed | IterationStatus::Failed)
    }
}

/// How an iteration inherits artifacts from its base iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceMode {
    #[default]
    None,
    Full,
    Partial,
}

/// Shape of a response to an input request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Text,
    Selection,
}

/// A registered workspace. Owns the pointer to its active iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Weak pointer; cleared when the referenced iteration is deleted.
    pub current_iteration_id: Option<String>,
}

/// Creation form for a new iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIteration {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_iteration_id: Option<String>,
    #[serde(default)]
    pub inheritance_mode: InheritanceMode,
}

/// One turn of the post-delivery conversation, as sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmTurn {
    pub role: PmRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PmRole {
    User,
    Assistant,
}

/// The engine's answer to one post-delivery turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmReply {
    pub message: String,
    #[serde(default)]
    pub actions: Vec<PmAction>,
}

/// Successful result of an outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Ack,
    Pm(PmReply),
}

/// Command result as seen by the core: the transport error is reduced to
/// its display text.
pub type CommandOutcome = Result<CommandReply, String>;
