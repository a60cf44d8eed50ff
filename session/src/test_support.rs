//! Test-only helpers: deterministic timestamps, envelope and iteration
//! builders, a scripted engine and a fixed clock.

use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::envelope::{
    AgentContent, Command, Envelope, InputOption, InputRequestPayload, ToolCallPayload,
    ToolResultPayload,
};
use crate::core::lifecycle::{Iteration, LifecycleEvent};
use crate::core::stage::StageKey;
use crate::core::types::{NewIteration, PmReply, PmTurn, ResponseType};
use crate::io::clock::Clock;
use crate::io::engine::{Engine, EngineError};
use crate::io::envelope_log::log_path;

/// Fixed base instant (2025-01-01T00:00:00Z) plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600 + secs, 0).unwrap_or_default()
}

/// Draft iteration in project `p` with sequence 1.
pub fn draft_iteration(id: &str) -> Iteration {
    Iteration::new(
        id,
        "p",
        1,
        NewIteration {
            title: format!("{id} title"),
            ..NewIteration::default()
        },
        at(0),
    )
}

pub fn running_iteration(id: &str) -> Iteration {
    let mut iteration = draft_iteration(id);
    let _ = iteration.transition(&LifecycleEvent::Execute, at(0));
    iteration
}

pub fn completed_iteration(id: &str) -> Iteration {
    let mut iteration = running_iteration(id);
    let _ = iteration.transition(&LifecycleEvent::Completed, at(0));
    iteration
}

pub fn agent_event(agent: &str, content: &str) -> Envelope {
    Envelope::AgentEvent(AgentContent {
        content: content.to_string(),
        agent_name: agent.to_string(),
        ..AgentContent::default()
    })
}

pub fn streaming_event(agent: &str, content: &str) -> Envelope {
    Envelope::AgentStreaming(AgentContent {
        content: content.to_string(),
        agent_name: agent.to_string(),
        ..AgentContent::default()
    })
}

pub fn thinking_event(agent: &str, content: &str) -> Envelope {
    Envelope::AgentStreaming(AgentContent {
        content: content.to_string(),
        agent_name: agent.to_string(),
        is_thinking: true,
        ..AgentContent::default()
    })
}

pub fn tool_call(agent: &str, tool: &str) -> Envelope {
    Envelope::ToolCall(ToolCallPayload {
        tool_name: tool.to_string(),
        arguments: serde_json::Map::new(),
        agent_name: agent.to_string(),
    })
}

pub fn tool_result(agent: &str, tool: &str, success: bool) -> Envelope {
    Envelope::ToolResult(ToolResultPayload {
        tool_name: tool.to_string(),
        result: if success { "ok" } else { "error" }.to_string(),
        success,
        agent_name: agent.to_string(),
    })
}

/// Request with one option per id; labels are left empty.
pub fn request_payload(request_id: &str, prompt: &str, option_ids: &[&str]) -> InputRequestPayload {
    InputRequestPayload {
        request_id: request_id.to_string(),
        prompt: prompt.to_string(),
        options: option_ids
            .iter()
            .map(|id| InputOption {
                id: (*id).to_string(),
                label: String::new(),
            })
            .collect(),
    }
}

/// Artifact confirmation with `approve`, `view` and `feedback` options.
pub fn artifact_request(request_id: &str, artifact: &str) -> InputRequestPayload {
    request_payload(
        request_id,
        &format!("Review the {artifact} [ARTIFACT_TYPE:{artifact}]"),
        &["approve", "view", "feedback"],
    )
}

pub fn artifact_input(request_id: &str, artifact: &str) -> Envelope {
    Envelope::InputRequest(artifact_request(request_id, artifact))
}

/// Lifecycle envelope builders.
pub mod lifecycle {
    use crate::core::envelope::Envelope;

    pub fn started(id: &str) -> Envelope {
        Envelope::IterationStarted {
            iteration_id: id.to_string(),
        }
    }

    pub fn continued(id: &str) -> Envelope {
        Envelope::IterationContinued {
            iteration_id: id.to_string(),
        }
    }

    pub fn completed(id: &str) -> Envelope {
        Envelope::IterationCompleted {
            iteration_id: id.to_string(),
        }
    }

    pub fn failed(id: &str, error: &str) -> Envelope {
        Envelope::IterationFailed {
            iteration_id: id.to_string(),
            error: error.to_string(),
        }
    }
}

/// Write `<dir>/<id>/envelopes.jsonl` files into a fresh temp dir.
pub fn log_dir(logs: &[(&str, &[Value])]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    for (iteration_id, lines) in logs {
        write_log(dir.path(), iteration_id, lines);
    }
    dir
}

pub fn write_log(dir: &std::path::Path, iteration_id: &str, lines: &[Value]) {
    let path = log_path(dir, iteration_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir: {err}"));
    }
    let mut text = String::new();
    for line in lines {
        text.push_str(&line.to_string());
        text.push('\n');
    }
    fs::write(&path, text).unwrap_or_else(|err| panic!("write log: {err}"));
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, secs: i64) {
        let mut now = lock(&self.now);
        *now += Duration::seconds(secs);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(at(0))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Ack,
    Pm(PmReply),
    Fail(EngineError),
}

/// Engine double: records every command, answers from a queue (acks and a
/// stock PM reply once the queue is empty) and can hold answers until
/// released.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    commands: Mutex<Vec<Command>>,
    script: Mutex<VecDeque<Scripted>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ack(&self) {
        lock(&self.script).push_back(Scripted::Ack);
    }

    pub fn push_pm_reply(&self, reply: PmReply) {
        lock(&self.script).push_back(Scripted::Pm(reply));
    }

    pub fn push_failure(&self, error: EngineError) {
        lock(&self.script).push_back(Scripted::Fail(error));
    }

    /// Hold every answer until [`ScriptedEngine::release`].
    pub fn hold(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held answers through.
    pub fn release(&self, count: usize) {
        if let Some(gate) = lock(&self.gate).as_ref() {
            gate.add_permits(count);
        }
    }

    /// Commands received so far, in call order.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.commands).clone()
    }

    async fn answer(&self, command: Command) -> Scripted {
        lock(&self.commands).push(command);
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        lock(&self.script).pop_front().unwrap_or(Scripted::Ack)
    }

    async fn ack(&self, command: Command) -> Result<(), EngineError> {
        match self.answer(command).await {
            Scripted::Ack | Scripted::Pm(_) => Ok(()),
            Scripted::Fail(err) => Err(err),
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn execute(&self, iteration_id: &str) -> Result<(), EngineError> {
        self.ack(Command::Execute {
            iteration_id: iteration_id.to_string(),
        })
        .await
    }

    async fn continue_iteration(&self, iteration_id: &str) -> Result<(), EngineError> {
        self.ack(Command::Continue {
            iteration_id: iteration_id.to_string(),
        })
        .await
    }

    async fn retry(&self, iteration_id: &str) -> Result<(), EngineError> {
        self.ack(Command::Retry {
            iteration_id: iteration_id.to_string(),
        })
        .await
    }

    async fn submit_input_response(
        &self,
        request_id: &str,
        response: &str,
        response_type: ResponseType,
    ) -> Result<(), EngineError> {
        self.ack(Command::SubmitInputResponse {
            request_id: request_id.to_string(),
            response: response.to_string(),
            response_type,
        })
        .await
    }

    async fn send_pm_message(
        &self,
        iteration_id: &str,
        message: &str,
        history: &[PmTurn],
    ) -> Result<PmReply, EngineError> {
        let answer = self
            .answer(Command::SendPmMessage {
                iteration_id: iteration_id.to_string(),
                message: message.to_string(),
                history: history.to_vec(),
            })
            .await;
        match answer {
            Scripted::Pm(reply) => Ok(reply),
            Scripted::Ack => Ok(PmReply {
                message: format!("noted: {message}"),
                actions: Vec::new(),
            }),
            Scripted::Fail(err) => Err(err),
        }
    }

    async fn restart_from_stage(
        &self,
        iteration_id: &str,
        target_stage: StageKey,
    ) -> Result<(), EngineError> {
        self.ack(Command::RestartFromStage {
            iteration_id: iteration_id.to_string(),
            target_stage,
        })
        .await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
