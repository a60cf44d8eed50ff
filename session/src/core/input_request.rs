//! Input-request coordinator: the human-confirmation handshake.
//!
//! At most one request exists per session. Phases:
//!
//! ```text
//! Idle --receive--> Pending --plain option / text--> Idle (response sent)
//!                    |  ^
//!           feedback |  | cancel
//!                    v  |
//!               FeedbackPending --submit--> Idle (text response sent)
//! ```
//!
//! A terminal lifecycle event forces Idle from any phase without sending.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::envelope::{InputOption, InputRequestPayload};
use crate::core::types::ResponseType;

static ARTIFACT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\[ARTIFACT_TYPE:(\w+)\]\s*$").expect("artifact marker pattern is valid")
});

pub const DEFAULT_FEEDBACK_PROMPT: &str = "What should be changed? Describe your feedback.";

/// Option ids with special meaning on artifact confirmations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionIds {
    /// Opens the artifact; the request stays pending.
    pub view_artifact: String,
    /// Switches to free-text feedback.
    pub feedback: String,
}

impl Default for OptionIds {
    fn default() -> Self {
        Self {
            view_artifact: "view".to_string(),
            feedback: "feedback".to_string(),
        }
    }
}

/// A pending question from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputRequest {
    pub request_id: String,
    /// Prompt with any artifact marker stripped.
    pub prompt: String,
    pub options: Vec<InputOption>,
    pub is_artifact_confirmation: bool,
    pub artifact_type: Option<String>,
    pub is_feedback_mode: bool,
}

impl InputRequest {
    pub fn from_payload(payload: &InputRequestPayload) -> Self {
        let (prompt, artifact_type) = strip_artifact_marker(&payload.prompt);
        Self {
            request_id: payload.request_id.clone(),
            prompt,
            options: payload.options.clone(),
            is_artifact_confirmation: artifact_type.is_some(),
            artifact_type,
            is_feedback_mode: false,
        }
    }

    fn option(&self, option_id: &str) -> Option<&InputOption> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

/// Split `"Approve? [ARTIFACT_TYPE:prd]"` into `("Approve?", Some("prd"))`.
pub fn strip_artifact_marker(prompt: &str) -> (String, Option<String>) {
    match ARTIFACT_MARKER.captures(prompt) {
        Some(caps) => {
            let start = caps.get(0).map_or(prompt.len(), |m| m.start());
            let artifact = caps.get(1).map(|m| m.as_str().to_string());
            (prompt[..start].to_string(), artifact)
        }
        None => (prompt.to_string(), None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Pending,
    FeedbackPending,
}

/// Local transcript entry produced by resolving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Echo {
    User(String),
    System(String),
}

/// A request answered by the human; the response is ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The resolved request, kept so a failed send can restore it.
    pub request: InputRequest,
    pub response: String,
    pub response_type: ResponseType,
    pub echo: Vec<Echo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Resolved(Resolution),
    /// Show the artifact; the request stays pending.
    ViewArtifact { artifact_type: String },
    /// Now in feedback mode; nothing was sent.
    FeedbackRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no input request is pending")]
    NoRequest,
    #[error("request '{incoming}' arrived while '{existing}' is still pending")]
    AlreadyPending { existing: String, incoming: String },
    #[error("request '{0}' is not the pending request")]
    UnknownRequest(String),
    #[error("request has no option '{0}'")]
    UnknownOption(String),
    #[error("feedback text is empty")]
    EmptyFeedback,
    #[error("response text is empty")]
    EmptyResponse,
    #[error("request is waiting for feedback text")]
    InFeedbackMode,
    #[error("request is not in feedback mode")]
    NotInFeedbackMode,
    #[error("request expects one of its options")]
    OptionRequired,
}

/// What collaborators render for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputRequestView {
    pub request_id: String,
    pub phase: Phase,
    /// The feedback prompt while in feedback mode.
    pub prompt: String,
    /// Hidden (empty) while in feedback mode.
    pub options: Vec<InputOption>,
    pub is_artifact_confirmation: bool,
    pub artifact_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InputCoordinator {
    request: Option<InputRequest>,
    ids: OptionIds,
    feedback_prompt: String,
}

impl Default for InputCoordinator {
    fn default() -> Self {
        Self::new(OptionIds::default(), DEFAULT_FEEDBACK_PROMPT)
    }
}

impl InputCoordinator {
    pub fn new(ids: OptionIds, feedback_prompt: impl Into<String>) -> Self {
        Self {
            request: None,
            ids,
            feedback_prompt: feedback_prompt.into(),
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.request {
            None => Phase::Idle,
            Some(request) if request.is_feedback_mode => Phase::FeedbackPending,
            Some(_) => Phase::Pending,
        }
    }

    pub fn request(&self) -> Option<&InputRequest> {
        self.request.as_ref()
    }

    /// Accept a new request. The existing one survives a conflict.
    pub fn receive(
        &mut self,
        payload: &InputRequestPayload,
    ) -> Result<&InputRequest, CoordinatorError> {
        if let Some(existing) = &self.request {
            return Err(CoordinatorError::AlreadyPending {
                existing: existing.request_id.clone(),
                incoming: payload.request_id.clone(),
            });
        }
        Ok(self.request.insert(InputRequest::from_payload(payload)))
    }

    /// Fail loudly when a response names a request that is not pending.
    pub fn check_request_id(&self, request_id: &str) -> Result<(), CoordinatorError> {
        match &self.request {
            Some(request) if request.request_id == request_id => Ok(()),
            _ => Err(CoordinatorError::UnknownRequest(request_id.to_string())),
        }
    }

    pub fn select(&mut self, option_id: &str) -> Result<Selection, CoordinatorError> {
        let request = self.request.as_mut().ok_or(CoordinatorError::NoRequest)?;
        if request.is_feedback_mode {
            return Err(CoordinatorError::InFeedbackMode);
        }
        let label = request
            .option(option_id)
            .ok_or_else(|| CoordinatorError::UnknownOption(option_id.to_string()))?
            .display_label()
            .to_string();

        if let Some(artifact_type) = request.artifact_type.clone() {
            if option_id == self.ids.view_artifact {
                return Ok(Selection::ViewArtifact { artifact_type });
            }
            if option_id == self.ids.feedback {
                request.is_feedback_mode = true;
                return Ok(Selection::FeedbackRequested);
            }
        }

        let request = self.take()?;
        Ok(Selection::Resolved(Resolution {
            request,
            response: option_id.to_string(),
            response_type: ResponseType::Selection,
            echo: vec![Echo::User(label)],
        }))
    }

    pub fn submit_feedback(&mut self, text: &str) -> Result<Resolution, CoordinatorError> {
        let request = self.request.as_ref().ok_or(CoordinatorError::NoRequest)?;
        if !request.is_feedback_mode {
            return Err(CoordinatorError::NotInFeedbackMode);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CoordinatorError::EmptyFeedback);
        }
        let notice = match &request.artifact_type {
            Some(artifact) => format!("Feedback submitted for {artifact}"),
            None => "Feedback submitted".to_string(),
        };
        let message = format!("💬 Feedback:\n{text}");
        let request = self.take()?;
        Ok(Resolution {
            request,
            response: message.clone(),
            response_type: ResponseType::Text,
            echo: vec![Echo::System(notice), Echo::User(message)],
        })
    }

    /// Leave feedback mode; the original prompt and options return.
    pub fn cancel_feedback(&mut self) -> Result<(), CoordinatorError> {
        let request = self.request.as_mut().ok_or(CoordinatorError::NoRequest)?;
        if !request.is_feedback_mode {
            return Err(CoordinatorError::NotInFeedbackMode);
        }
        request.is_feedback_mode = false;
        Ok(())
    }

    /// Free-text answer to a request that offers no options.
    pub fn respond_text(&mut self, text: &str) -> Result<Resolution, CoordinatorError> {
        let request = self.request.as_ref().ok_or(CoordinatorError::NoRequest)?;
        if request.is_feedback_mode {
            return Err(CoordinatorError::InFeedbackMode);
        }
        if !request.options.is_empty() {
            return Err(CoordinatorError::OptionRequired);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CoordinatorError::EmptyResponse);
        }
        let request = self.take()?;
        Ok(Resolution {
            request,
            response: text.to_string(),
            response_type: ResponseType::Text,
            echo: vec![Echo::User(text.to_string())],
        })
    }

    /// Drop the request without sending anything.
    pub fn force_cancel(&mut self) -> Option<InputRequest> {
        self.request.take()
    }

    /// Put back a request whose response failed to send. Refused when a newer
    /// request has already arrived.
    pub fn restore(&mut self, mut request: InputRequest) -> bool {
        if self.request.is_some() {
            return false;
        }
        request.is_feedback_mode = false;
        self.request = Some(request);
        true
    }

    /// Undo a forced cancel, feedback mode included. Refused when another
    /// request has arrived since.
    pub fn reinstate(&mut self, request: InputRequest) -> bool {
        if self.request.is_some() {
            return false;
        }
        self.request = Some(request);
        true
    }

    pub fn view(&self) -> Option<InputRequestView> {
        let request = self.request.as_ref()?;
        let (prompt, options) = if request.is_feedback_mode {
            (self.feedback_prompt.clone(), Vec::new())
        } else {
            (request.prompt.clone(), request.options.clone())
        };
        Some(InputRequestView {
            request_id: request.request_id.clone(),
            phase: self.phase(),
            prompt,
            options,
            is_artifact_confirmation: request.is_artifact_confirmation,
            artifact_type: request.artifact_type.clone(),
        })
    }

    fn take(&mut self) -> Result<InputRequest, CoordinatorError> {
        self.request.take().ok_or(CoordinatorError::NoRequest)
    }
}
