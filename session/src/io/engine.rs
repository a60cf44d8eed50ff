//! Outbound seam to the execution engine.
//!
//! The engine is an opaque collaborator: it accepts commands and reports
//! progress through the envelope stream. Implementations must be safe to call
//! from many tasks at once; the session never issues two commands for the same
//! turn concurrently.

use async_trait::async_trait;

use crate::core::envelope::Command;
use crate::core::stage::StageKey;
use crate::core::types::{CommandReply, PmReply, PmTurn, ResponseType};

/// Transport or engine-side failure of one command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine rejected {command}: {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },
    #[error("engine transport failed: {0}")]
    Transport(String),
}

/// Commands the session issues to the execution engine.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn execute(&self, iteration_id: &str) -> Result<(), EngineError>;

    async fn continue_iteration(&self, iteration_id: &str) -> Result<(), EngineError>;

    async fn retry(&self, iteration_id: &str) -> Result<(), EngineError>;

    async fn submit_input_response(
        &self,
        request_id: &str,
        response: &str,
        response_type: ResponseType,
    ) -> Result<(), EngineError>;

    /// One post-delivery turn. `history` excludes `message`.
    async fn send_pm_message(
        &self,
        iteration_id: &str,
        message: &str,
        history: &[PmTurn],
    ) -> Result<PmReply, EngineError>;

    async fn restart_from_stage(
        &self,
        iteration_id: &str,
        target_stage: StageKey,
    ) -> Result<(), EngineError>;
}

/// Route a [`Command`] to the matching engine method.
pub async fn dispatch(engine: &dyn Engine, command: &Command) -> Result<CommandReply, EngineError> {
    match command {
        Command::Execute { iteration_id } => engine.execute(iteration_id).await?,
        Command::Continue { iteration_id } => engine.continue_iteration(iteration_id).await?,
        Command::Retry { iteration_id } => engine.retry(iteration_id).await?,
        Command::SubmitInputResponse {
            request_id,
            response,
            response_type,
        } => {
            engine
                .submit_input_response(request_id, response, *response_type)
                .await?;
        }
        Command::SendPmMessage {
            iteration_id,
            message,
            history,
        } => {
            let reply = engine
                .send_pm_message(iteration_id, message, history)
                .await?;
            return Ok(CommandReply::Pm(reply));
        }
        Command::RestartFromStage {
            iteration_id,
            target_stage,
        } => engine.restart_from_stage(iteration_id, *target_stage).await?,
    }
    Ok(CommandReply::Ack)
}
