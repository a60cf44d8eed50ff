//! Envelope model: inbound notifications from the engine and outbound commands.
//!
//! Inbound envelopes are parsed from a loose `{event, iteration_id?, payload?}`
//! shape into [`Envelope`]. Anything that does not fit is an
//! [`EnvelopeError`]; callers log and drop it rather than abort.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::stage::StageKey;
use crate::core::types::{PmTurn, ResponseType};

/// Content fragment from an agent (`agent_event` / `agent_streaming`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl AgentContent {
    /// Thinking is flagged either by `is_thinking` or by `message_type`.
    pub fn is_thinking(&self) -> bool {
        self.is_thinking || self.message_type.as_deref() == Some("thinking")
    }

    pub fn is_error(&self) -> bool {
        self.level
            .as_deref()
            .is_some_and(|level| level.eq_ignore_ascii_case("error"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub agent_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_name: String,
    #[serde(default, deserialize_with = "result_text")]
    pub result: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub agent_name: String,
}

/// A selectable answer offered by an input request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

impl InputOption {
    /// Label shown to the human; falls back to the id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequestPayload {
    pub request_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<InputOption>,
}

/// One inbound notification from the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    IterationCreated,
    IterationStarted { iteration_id: String },
    IterationContinued { iteration_id: String },
    IterationCompleted { iteration_id: String },
    IterationFailed { iteration_id: String, error: String },
    AgentEvent(AgentContent),
    AgentStreaming(AgentContent),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    InputRequest(InputRequestPayload),
    ProjectLoaded,
    ProjectInitialized,
}

impl Envelope {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::IterationCreated => "iteration_created",
            Envelope::IterationStarted { .. } => "iteration_started",
            Envelope::IterationContinued { .. } => "iteration_continued",
            Envelope::IterationCompleted { .. } => "iteration_completed",
            Envelope::IterationFailed { .. } => "iteration_failed",
            Envelope::AgentEvent(_) => "agent_event",
            Envelope::AgentStreaming(_) => "agent_streaming",
            Envelope::ToolCall(_) => "tool_call",
            Envelope::ToolResult(_) => "tool_result",
            Envelope::InputRequest(_) => "input_request",
            Envelope::ProjectLoaded => "project_loaded",
            Envelope::ProjectInitialized => "project_initialized",
        }
    }

    /// Iteration named by a lifecycle payload, if any.
    pub fn lifecycle_iteration(&self) -> Option<&str> {
        match self {
            Envelope::IterationStarted { iteration_id }
            | Envelope::IterationContinued { iteration_id }
            | Envelope::IterationCompleted { iteration_id }
            | Envelope::IterationFailed { iteration_id, .. } => Some(iteration_id),
            _ => None,
        }
    }

    /// Envelopes that invalidate the project's iteration list.
    pub fn refreshes_iteration_list(&self) -> bool {
        matches!(
            self,
            Envelope::IterationCreated
                | Envelope::IterationCompleted { .. }
                | Envelope::IterationFailed { .. }
        )
    }

    /// Envelopes that reset every session and reload from the store.
    pub fn resets_project(&self) -> bool {
        matches!(self, Envelope::ProjectLoaded | Envelope::ProjectInitialized)
    }
}

/// An envelope plus the routing key it arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub iteration_id: Option<String>,
    pub envelope: Envelope,
}

impl Inbound {
    pub fn new(iteration_id: Option<String>, envelope: Envelope) -> Self {
        Self {
            iteration_id,
            envelope,
        }
    }

    /// Explicit routing key, falling back to the lifecycle payload.
    pub fn target(&self) -> Option<&str> {
        self.iteration_id
            .as_deref()
            .or_else(|| self.envelope.lifecycle_iteration())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no 'event' name")]
    MissingEvent,
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("malformed '{event}' payload: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct IterationRef {
    iteration_id: String,
}

#[derive(Deserialize)]
struct IterationFailure {
    iteration_id: String,
    #[serde(default, alias = "error_text")]
    error: String,
}

/// Parse one envelope from a JSON value.
pub fn parse_envelope(value: &Value) -> Result<Inbound, EnvelopeError> {
    let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
    let event = object
        .get("event")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingEvent)?;
    let iteration_id = object
        .get("iteration_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let payload = object.get("payload").cloned().unwrap_or(Value::Null);

    let envelope = match event {
        "iteration_created" => Envelope::IterationCreated,
        "iteration_started" => {
            let r: IterationRef = payload_of(event, payload, iteration_id.as_deref())?;
            Envelope::IterationStarted {
                iteration_id: r.iteration_id,
            }
        }
        "iteration_continued" => {
            let r: IterationRef = payload_of(event, payload, iteration_id.as_deref())?;
            Envelope::IterationContinued {
                iteration_id: r.iteration_id,
            }
        }
        "iteration_completed" => {
            let r: IterationRef = payload_of(event, payload, iteration_id.as_deref())?;
            Envelope::IterationCompleted {
                iteration_id: r.iteration_id,
            }
        }
        "iteration_failed" => {
            let f: IterationFailure = payload_of(event, payload, iteration_id.as_deref())?;
            Envelope::IterationFailed {
                iteration_id: f.iteration_id,
                error: f.error,
            }
        }
        "agent_event" => Envelope::AgentEvent(payload_of(event, payload, None)?),
        "agent_streaming" => Envelope::AgentStreaming(payload_of(event, payload, None)?),
        "tool_call" => Envelope::ToolCall(payload_of(event, payload, None)?),
        "tool_result" => Envelope::ToolResult(payload_of(event, payload, None)?),
        "input_request" => Envelope::InputRequest(payload_of(event, payload, None)?),
        "project_loaded" => Envelope::ProjectLoaded,
        "project_initialized" => Envelope::ProjectInitialized,
        other => return Err(EnvelopeError::UnknownEvent(other.to_string())),
    };

    Ok(Inbound::new(iteration_id, envelope))
}

/// Parse one envelope from a line of JSON text.
pub fn parse_envelope_str(line: &str) -> Result<Inbound, EnvelopeError> {
    let value: Value = serde_json::from_str(line)?;
    parse_envelope(&value)
}

/// Deserialize a payload; a top-level `iteration_id` fills in a missing one.
fn payload_of<T: DeserializeOwned>(
    event: &str,
    payload: Value,
    iteration_id: Option<&str>,
) -> Result<T, EnvelopeError> {
    let payload = match (payload, iteration_id) {
        (Value::Null, Some(id)) => serde_json::json!({ "iteration_id": id }),
        (Value::Object(mut map), Some(id)) => {
            map.entry("iteration_id")
                .or_insert_with(|| Value::String(id.to_string()));
            Value::Object(map)
        }
        (Value::Null, None) => Value::Object(Map::new()),
        (other, _) => other,
    };
    serde_json::from_value(payload).map_err(|source| EnvelopeError::MalformedPayload {
        event: event.to_string(),
        source,
    })
}

/// Tool results arrive as text or as arbitrary JSON; keep them as text.
fn result_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Outbound command to the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Execute {
        iteration_id: String,
    },
    Continue {
        iteration_id: String,
    },
    Retry {
        iteration_id: String,
    },
    SubmitInputResponse {
        request_id: String,
        response: String,
        response_type: ResponseType,
    },
    SendPmMessage {
        iteration_id: String,
        message: String,
        history: Vec<PmTurn>,
    },
    RestartFromStage {
        iteration_id: String,
        target_stage: StageKey,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Execute { .. } => "execute",
            Command::Continue { .. } => "continue",
            Command::Retry { .. } => "retry",
            Command::SubmitInputResponse { .. } => "submit_input_response",
            Command::SendPmMessage { .. } => "send_pm_message",
            Command::RestartFromStage { .. } => "restart_from_stage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_agent_event_payload() {
        let inbound = parse_envelope(&json!({
            "event": "agent_event",
            "iteration_id": "it-1",
            "payload": {
                "content": "hello",
                "message_type": "thinking",
                "agent_name": "planner",
                "stage_name": "plan"
            }
        }))
        .expect("parse");

        assert_eq!(inbound.target(), Some("it-1"));
        let Envelope::AgentEvent(content) = inbound.envelope else {
            panic!("expected agent event");
        };
        assert!(content.is_thinking());
        assert_eq!(content.agent_name, "planner");
        assert_eq!(content.stage_name.as_deref(), Some("plan"));
    }

    #[test]
    fn lifecycle_id_comes_from_top_level_when_payload_missing() {
        let inbound = parse_envelope(&json!({
            "event": "iteration_completed",
            "iteration_id": "it-9"
        }))
        .expect("parse");
        assert_eq!(
            inbound.envelope,
            Envelope::IterationCompleted {
                iteration_id: "it-9".to_string()
            }
        );
    }

    #[test]
    fn iteration_failed_accepts_error_text_alias() {
        let inbound = parse_envelope(&json!({
            "event": "iteration_failed",
            "payload": { "iteration_id": "it-2", "error_text": "boom" }
        }))
        .expect("parse");
        assert_eq!(inbound.target(), Some("it-2"));
        assert_eq!(
            inbound.envelope,
            Envelope::IterationFailed {
                iteration_id: "it-2".to_string(),
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn tool_result_keeps_structured_result_as_text() {
        let inbound = parse_envelope(&json!({
            "event": "tool_result",
            "payload": { "tool_name": "ls", "result": { "files": 3 }, "success": true }
        }))
        .expect("parse");
        let Envelope::ToolResult(result) = inbound.envelope else {
            panic!("expected tool result");
        };
        assert_eq!(result.result, r#"{"files":3}"#);
        assert!(result.success);
    }

    #[test]
    fn rejects_unknown_and_malformed_envelopes() {
        let err = parse_envelope(&json!({ "event": "telemetry" })).expect_err("unknown");
        assert!(matches!(err, EnvelopeError::UnknownEvent(name) if name == "telemetry"));

        let err = parse_envelope(&json!({ "event": "input_request", "payload": { "prompt": 3 } }))
            .expect_err("malformed");
        assert!(err.to_string().contains("malformed 'input_request' payload"));

        let err = parse_envelope(&json!({ "payload": {} })).expect_err("missing event");
        assert!(matches!(err, EnvelopeError::MissingEvent));

        let err = parse_envelope_str("not json").expect_err("bad json");
        assert!(matches!(err, EnvelopeError::Json(_)));
    }

    #[test]
    fn refresh_and_reset_classification() {
        assert!(Envelope::IterationCreated.refreshes_iteration_list());
        assert!(
            Envelope::IterationFailed {
                iteration_id: "x".to_string(),
                error: String::new()
            }
            .refreshes_iteration_list()
        );
        assert!(!Envelope::AgentEvent(AgentContent::default()).refreshes_iteration_list());
        assert!(Envelope::ProjectInitialized.resets_project());
    }

    #[test]
    fn option_label_falls_back_to_id() {
        let option = InputOption {
            id: "yes".to_string(),
            label: String::new(),
        };
        assert_eq!(option.display_label(), "yes");
    }
}
