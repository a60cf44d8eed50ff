//! Transcript reducer: folds content, thinking, and tool envelopes into an
//! ordered list of display messages.
//!
//! Token streaming is handled by concatenation: a fragment extends the last
//! message only when that message is still streaming, is of the same kind,
//! and belongs to the same agent. Everything else appends. Only the trailing
//! message is ever extended, so each envelope costs O(1) and a late fragment
//! can never corrupt an earlier message.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::envelope::{AgentContent, Envelope, ToolCallPayload, ToolResultPayload};
use crate::core::message::ChatMessage;
use crate::core::pm::PmAction;

/// What a single `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new message was pushed.
    Appended,
    /// The trailing streaming message grew.
    Extended,
    /// Empty content fragment; nothing to show.
    Dropped,
    /// Not a transcript envelope (lifecycle, input request, ...).
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("no message at index {0}")]
    OutOfRange(usize),
    #[error("message {index} is {kind}, not thinking")]
    NotThinking { index: usize, kind: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Agent,
    Thinking,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Fold one envelope into the transcript.
    pub fn apply(&mut self, envelope: &Envelope, at: DateTime<Utc>) -> Applied {
        match envelope {
            Envelope::AgentEvent(content) | Envelope::AgentStreaming(content) => {
                self.apply_content(content, at)
            }
            Envelope::ToolCall(call) => {
                self.push(tool_call_message(call, at));
                Applied::Appended
            }
            Envelope::ToolResult(result) => {
                self.push(tool_result_message(result, at));
                Applied::Appended
            }
            Envelope::IterationCreated
            | Envelope::IterationStarted { .. }
            | Envelope::IterationContinued { .. }
            | Envelope::IterationCompleted { .. }
            | Envelope::IterationFailed { .. }
            | Envelope::InputRequest(_)
            | Envelope::ProjectLoaded
            | Envelope::ProjectInitialized => Applied::NotApplicable,
        }
    }

    fn apply_content(&mut self, content: &AgentContent, at: DateTime<Utc>) -> Applied {
        if content.content.is_empty() {
            return Applied::Dropped;
        }
        if content.is_error() {
            self.push_error(content.content.clone(), at);
            return Applied::Appended;
        }
        let kind = if content.is_thinking() {
            StreamKind::Thinking
        } else {
            StreamKind::Agent
        };
        if let Some(buffer) = self.streaming_buffer(kind, &content.agent_name) {
            buffer.push_str(&content.content);
            return Applied::Extended;
        }
        let message = match kind {
            StreamKind::Agent => ChatMessage::Agent {
                timestamp: at,
                content: content.content.clone(),
                agent_name: content.agent_name.clone(),
                stage_name: content.stage_name.clone(),
                is_streaming: true,
            },
            StreamKind::Thinking => ChatMessage::Thinking {
                timestamp: at,
                content: content.content.clone(),
                agent_name: content.agent_name.clone(),
                stage_name: content.stage_name.clone(),
                is_streaming: true,
                is_expanded: false,
            },
        };
        self.push(message);
        Applied::Appended
    }

    /// Content buffer of the trailing message if a fragment may extend it.
    fn streaming_buffer(&mut self, kind: StreamKind, agent: &str) -> Option<&mut String> {
        match self.messages.last_mut()? {
            ChatMessage::Agent {
                content,
                agent_name,
                is_streaming: true,
                ..
            } if kind == StreamKind::Agent && agent_name.as_str() == agent => Some(content),
            ChatMessage::Thinking {
                content,
                agent_name,
                is_streaming: true,
                ..
            } if kind == StreamKind::Thinking && agent_name.as_str() == agent => Some(content),
            _ => None,
        }
    }

    /// Close the trailing stream so no later fragment can extend it.
    pub fn finish_streaming(&mut self) {
        if let Some(
            ChatMessage::Agent { is_streaming, .. } | ChatMessage::Thinking { is_streaming, .. },
        ) = self.messages.last_mut()
        {
            *is_streaming = false;
        }
    }

    fn push(&mut self, message: ChatMessage) {
        self.finish_streaming();
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>, at: DateTime<Utc>) {
        self.push(ChatMessage::User {
            timestamp: at,
            content: content.into(),
        });
    }

    pub fn push_system(&mut self, content: impl Into<String>, at: DateTime<Utc>) {
        self.push(ChatMessage::System {
            timestamp: at,
            content: content.into(),
        });
    }

    pub fn push_error(&mut self, content: impl Into<String>, at: DateTime<Utc>) {
        self.push(ChatMessage::Error {
            timestamp: at,
            content: content.into(),
        });
    }

    pub fn push_pm(
        &mut self,
        content: impl Into<String>,
        actions: Vec<PmAction>,
        at: DateTime<Utc>,
    ) {
        self.push(ChatMessage::PmAgent {
            timestamp: at,
            content: content.into(),
            actions,
        });
    }

    /// Flip `is_expanded` on a thinking message. Content and streaming state
    /// are untouched.
    pub fn toggle_expanded(&mut self, index: usize) -> Result<bool, TranscriptError> {
        let message = self
            .messages
            .get_mut(index)
            .ok_or(TranscriptError::OutOfRange(index))?;
        match message {
            ChatMessage::Thinking { is_expanded, .. } => {
                *is_expanded = !*is_expanded;
                Ok(*is_expanded)
            }
            other => Err(TranscriptError::NotThinking {
                index,
                kind: other.kind(),
            }),
        }
    }
}

/// By-value form of [`Transcript::apply`].
pub fn reduce(mut transcript: Transcript, envelope: &Envelope, at: DateTime<Utc>) -> Transcript {
    transcript.apply(envelope, at);
    transcript
}

fn tool_call_message(call: &ToolCallPayload, at: DateTime<Utc>) -> ChatMessage {
    ChatMessage::ToolCall {
        timestamp: at,
        tool_name: call.tool_name.clone(),
        arguments: call.arguments.clone(),
        agent_name: call.agent_name.clone(),
    }
}

fn tool_result_message(result: &ToolResultPayload, at: DateTime<Utc>) -> ChatMessage {
    ChatMessage::ToolResult {
        timestamp: at,
        tool_name: result.tool_name.clone(),
        result: result.result.clone(),
        success: result.success,
        agent_name: result.agent_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{agent_event, at, thinking_event, tool_call, tool_result};

    fn contents(transcript: &Transcript) -> Vec<(&'static str, &str)> {
        transcript
            .messages()
            .iter()
            .map(|m| (m.kind(), m.content()))
            .collect()
    }

    /// Two fragments from the same agent become one message, in order.
    #[test]
    fn consecutive_fragments_concatenate() {
        let mut transcript = Transcript::new();
        assert_eq!(
            transcript.apply(&agent_event("coder", "Hel"), at(0)),
            Applied::Appended
        );
        assert_eq!(
            transcript.apply(&agent_event("coder", "lo"), at(1)),
            Applied::Extended
        );

        assert_eq!(contents(&transcript), vec![("agent", "Hello")]);
        assert!(transcript.messages()[0].is_streaming());
        assert_eq!(transcript.messages()[0].timestamp(), at(0));
    }

    /// A tool call between fragments splits them into separate messages.
    #[test]
    fn tool_call_prevents_merge() {
        let mut transcript = Transcript::new();
        transcript.apply(&agent_event("coder", "before"), at(0));
        transcript.apply(&tool_call("coder", "write_file"), at(1));
        assert_eq!(
            transcript.apply(&agent_event("coder", "after"), at(2)),
            Applied::Appended
        );

        assert_eq!(
            contents(&transcript),
            vec![
                ("agent", "before"),
                ("tool_call", "write_file"),
                ("agent", "after")
            ]
        );
        assert!(!transcript.messages()[0].is_streaming());
        assert!(transcript.messages()[2].is_streaming());
    }

    #[test]
    fn different_agents_do_not_merge() {
        let mut transcript = Transcript::new();
        transcript.apply(&agent_event("planner", "a"), at(0));
        transcript.apply(&agent_event("coder", "b"), at(1));
        assert_eq!(transcript.len(), 2);
        assert!(!transcript.messages()[0].is_streaming());
    }

    #[test]
    fn thinking_merges_only_with_thinking_from_same_agent() {
        let mut transcript = Transcript::new();
        transcript.apply(&thinking_event("planner", "hmm "), at(0));
        transcript.apply(&thinking_event("planner", "ok"), at(1));
        transcript.apply(&thinking_event("critic", "no"), at(2));
        transcript.apply(&agent_event("critic", "answer"), at(3));

        assert_eq!(
            contents(&transcript),
            vec![
                ("thinking", "hmm ok"),
                ("thinking", "no"),
                ("agent", "answer")
            ]
        );
    }

    #[test]
    fn empty_fragments_are_dropped() {
        let mut transcript = Transcript::new();
        assert_eq!(
            transcript.apply(&agent_event("coder", ""), at(0)),
            Applied::Dropped
        );
        assert!(transcript.is_empty());
    }

    #[test]
    fn tool_results_always_append() {
        let mut transcript = Transcript::new();
        transcript.apply(&tool_result("coder", "ls", true), at(0));
        transcript.apply(&tool_result("coder", "ls", false), at(1));
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn error_level_appends_error_message() {
        let mut transcript = Transcript::new();
        transcript.apply(&agent_event("coder", "partial"), at(0));
        let envelope = Envelope::AgentEvent(AgentContent {
            content: "model overloaded".to_string(),
            agent_name: "coder".to_string(),
            level: Some("ERROR".to_string()),
            ..AgentContent::default()
        });
        transcript.apply(&envelope, at(1));
        assert_eq!(
            contents(&transcript),
            vec![("agent", "partial"), ("error", "model overloaded")]
        );
    }

    /// Once closed, a stream is never reopened by a matching fragment.
    #[test]
    fn finished_stream_is_not_extended() {
        let mut transcript = Transcript::new();
        transcript.apply(&agent_event("coder", "done"), at(0));
        transcript.finish_streaming();
        transcript.apply(&agent_event("coder", "new"), at(1));
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn toggle_only_touches_expansion() {
        let mut transcript = Transcript::new();
        transcript.apply(&thinking_event("planner", "idea"), at(0));
        transcript.apply(&agent_event("planner", "text"), at(1));

        assert_eq!(transcript.toggle_expanded(0), Ok(true));
        let ChatMessage::Thinking {
            content,
            is_streaming,
            is_expanded,
            ..
        } = &transcript.messages()[0]
        else {
            panic!("expected thinking");
        };
        assert_eq!(content, "idea");
        assert!(!is_streaming);
        assert!(is_expanded);

        assert_eq!(
            transcript.toggle_expanded(1),
            Err(TranscriptError::NotThinking {
                index: 1,
                kind: "agent"
            })
        );
        assert_eq!(
            transcript.toggle_expanded(5),
            Err(TranscriptError::OutOfRange(5))
        );
    }

    #[test]
    fn toggle_does_not_close_stream() {
        let mut transcript = Transcript::new();
        transcript.apply(&thinking_event("planner", "a"), at(0));
        transcript.toggle_expanded(0).expect("toggle");
        transcript.apply(&thinking_event("planner", "b"), at(1));
        assert_eq!(contents(&transcript), vec![("thinking", "ab")]);
    }

    #[test]
    fn lifecycle_envelopes_are_not_applicable() {
        let transcript = reduce(
            Transcript::new(),
            &Envelope::IterationStarted {
                iteration_id: "it".to_string(),
            },
            at(0),
        );
        assert!(transcript.is_empty());
    }
}
