//! Per-session actor: one tokio task owns a [`SessionState`].
//!
//! Inputs (envelopes, human actions, command completions) arrive on one
//! bounded channel and are applied one at a time, so envelope *n+1* is never
//! read before *n* is committed and a slow consumer back-pressures the
//! source. Outbound commands run on their own tasks and report back through
//! the same channel; the actor keeps folding envelopes meanwhile.
//!
//! Snapshots go out on a `watch` channel after every input; side events
//! (artifact views, refresh requests, ...) on a shared `broadcast` channel.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, instrument, warn};

use crate::core::envelope::{Command, Envelope};
use crate::core::session::{
    ActionReply, Effect, SessionError, SessionSnapshot, SessionState, UserAction,
};
use crate::core::types::CommandReply;
use crate::io::clock::Clock;
use crate::io::engine::{self, Engine, EngineError};

/// Notable things a session wants its surroundings to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ShowArtifact {
        iteration_id: String,
        artifact_type: String,
    },
    CreateIteration {
        base_iteration_id: String,
    },
    RefreshIterations {
        iteration_id: String,
    },
    Resync {
        iteration_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("session '{0}' has stopped")]
    Closed(String),
}

pub type ActionResult = Result<ActionReply, ActorError>;

enum Input {
    Envelope {
        envelope: Envelope,
        /// Signalled once the envelope is committed and published.
        committed: Option<oneshot::Sender<()>>,
    },
    Action {
        action: UserAction,
        reply: oneshot::Sender<Result<Submitted, ActorError>>,
    },
    CommandDone {
        ticket: u64,
        result: Result<CommandReply, EngineError>,
    },
}

/// Shared collaborators handed to every actor.
#[derive(Clone)]
pub struct ActorContext {
    pub engine: Arc<dyn Engine>,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<SessionEvent>,
    /// Capacity of the inbound channel.
    pub buffer: usize,
}

/// An action the session accepted. A dispatched command finishes later;
/// await [`Submitted::completion`] for the engine's answer.
#[derive(Debug)]
pub struct Submitted {
    iteration_id: String,
    reply: ActionReply,
    outcome: Option<oneshot::Receiver<ActionResult>>,
}

impl Submitted {
    pub fn reply(&self) -> &ActionReply {
        &self.reply
    }

    /// Whether an outbound command is still outstanding.
    pub fn is_dispatched(&self) -> bool {
        self.outcome.is_some()
    }

    /// Resolve once the dispatched command (if any) has been answered.
    pub async fn completion(self) -> ActionResult {
        match self.outcome {
            Some(outcome) => outcome
                .await
                .map_err(|_| ActorError::Closed(self.iteration_id))?,
            None => Ok(self.reply),
        }
    }
}

/// Owner-side handle to a running session actor.
pub struct SessionHandle {
    iteration_id: String,
    inbox: mpsc::Sender<Input>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Start an actor for `state`. It stops when `parent` is cancelled, when
/// [`SessionHandle::shutdown`] is called, or when the handle is dropped.
pub fn spawn_session(
    state: SessionState,
    ctx: ActorContext,
    parent: &CancellationToken,
) -> SessionHandle {
    let iteration_id = state.iteration().id.clone();
    let (inbox, rx) = mpsc::channel(ctx.buffer.max(1));
    let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
    let cancel = parent.child_token();

    let actor = SessionActor {
        iteration_id: iteration_id.clone(),
        state,
        ctx,
        snapshot_tx,
        inbox: inbox.downgrade(),
        waiting: HashMap::new(),
        cancel: cancel.clone(),
    };
    let span = info_span!("session", iteration = %iteration_id);
    let task = tokio::spawn(actor.run(rx).instrument(span));

    SessionHandle {
        iteration_id,
        inbox,
        snapshots,
        cancel,
        task: Some(task),
    }
}

impl SessionHandle {
    pub fn iteration_id(&self) -> &str {
        &self.iteration_id
    }

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Queue an envelope; waits while the inbound channel is full.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), ActorError> {
        self.inbox
            .send(Input::Envelope {
                envelope,
                committed: None,
            })
            .await
            .map_err(|_| self.closed())
    }

    /// Queue an envelope and wait until the actor has committed it.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), ActorError> {
        let (committed, rx) = oneshot::channel();
        self.inbox
            .send(Input::Envelope {
                envelope,
                committed: Some(committed),
            })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Hand a human action to the session. Resolves as soon as the session
    /// has accepted or rejected it; envelopes keep flowing while a
    /// dispatched command is outstanding.
    #[instrument(skip(self, action), fields(iteration = %self.iteration_id, action = action.name()))]
    pub async fn submit(&self, action: UserAction) -> Result<Submitted, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Input::Action { action, reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Perform a human action and wait for any command it dispatched.
    pub async fn act(&self, action: UserAction) -> ActionResult {
        self.submit(action).await?.completion().await
    }

    fn closed(&self) -> ActorError {
        ActorError::Closed(self.iteration_id.clone())
    }

    /// Wait until a snapshot satisfies `predicate`, returning it.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot, ActorError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| ActorError::Closed(self.iteration_id.clone()))?;
        Ok(snapshot.clone())
    }

    /// Cancel the actor and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(iteration = %self.iteration_id, %err, "session actor panicked");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionActor {
    iteration_id: String,
    state: SessionState,
    ctx: ActorContext,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    inbox: mpsc::WeakSender<Input>,
    /// Callers waiting on a dispatched command, keyed by ticket.
    waiting: HashMap<u64, oneshot::Sender<ActionResult>>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Input>) {
        debug!("session actor started");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                input = rx.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
        }
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(ActorError::Closed(self.iteration_id.clone())));
        }
        debug!("session actor stopped");
    }

    fn handle(&mut self, input: Input) {
        let now = self.ctx.clock.now();
        let mut ack = None;
        let effects = match input {
            Input::Envelope {
                envelope,
                committed,
            } => {
                debug!(event = envelope.name(), "envelope");
                let effects = self.state.apply_envelope(&envelope, now);
                ack = committed;
                effects
            }
            Input::Action { action, reply } => match self.state.handle(action, now) {
                Ok(handled) => {
                    let outcome = match handled.reply {
                        ActionReply::Dispatched { ticket } => {
                            let (done, outcome) = oneshot::channel();
                            self.waiting.insert(ticket, done);
                            Some(outcome)
                        }
                        _ => None,
                    };
                    let _ = reply.send(Ok(Submitted {
                        iteration_id: self.iteration_id.clone(),
                        reply: handled.reply,
                        outcome,
                    }));
                    handled.effects
                }
                Err(err) => {
                    warn!(%err, "action rejected");
                    let _ = reply.send(Err(err.into()));
                    Vec::new()
                }
            },
            Input::CommandDone { ticket, result } => {
                let outcome = result.clone().map_err(|err| err.to_string());
                let effects = self.state.command_finished(ticket, outcome, now);
                if let Some(reply) = self.waiting.remove(&ticket) {
                    let answer = result
                        .map(|_| ActionReply::Dispatched { ticket })
                        .map_err(ActorError::from);
                    let _ = reply.send(answer);
                }
                effects
            }
        };
        self.run_effects(effects);
        self.snapshot_tx.send_replace(self.state.snapshot());
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            let event = match effect {
                Effect::Dispatch { ticket, command } => {
                    self.spawn_command(ticket, command);
                    continue;
                }
                Effect::ShowArtifact { artifact_type } => SessionEvent::ShowArtifact {
                    iteration_id: self.iteration_id.clone(),
                    artifact_type,
                },
                Effect::CreateIteration { base_iteration_id } => {
                    SessionEvent::CreateIteration { base_iteration_id }
                }
                Effect::RefreshIterations => SessionEvent::RefreshIterations {
                    iteration_id: self.iteration_id.clone(),
                },
                Effect::Resync => SessionEvent::Resync {
                    iteration_id: self.iteration_id.clone(),
                },
            };
            // No subscribers is fine.
            let _ = self.ctx.events.send(event);
        }
    }

    fn spawn_command(&self, ticket: u64, command: Command) {
        let engine = Arc::clone(&self.ctx.engine);
        let inbox = self.inbox.clone();
        let cancel = self.cancel.clone();
        let span = info_span!("command", ticket, command = command.name());
        tokio::spawn(
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = engine::dispatch(engine.as_ref(), &command) => result,
                };
                if let Err(err) = &result {
                    debug!(%err, "command failed");
                }
                if let Some(inbox) = inbox.upgrade() {
                    let _ = inbox.send(Input::CommandDone { ticket, result }).await;
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionOptions;
    use crate::core::types::IterationStatus;
    use crate::test_support::{FixedClock, ScriptedEngine, agent_event, draft_iteration, lifecycle};

    fn context(engine: Arc<ScriptedEngine>) -> ActorContext {
        let (events, _) = broadcast::channel(16);
        ActorContext {
            engine,
            clock: Arc::new(FixedClock::default()),
            events,
            buffer: 8,
        }
    }

    fn spawn(engine: Arc<ScriptedEngine>) -> (SessionHandle, CancellationToken) {
        let root = CancellationToken::new();
        let state = SessionState::new(draft_iteration("it-1"), &SessionOptions::default());
        (spawn_session(state, context(engine), &root), root)
    }

    #[tokio::test]
    async fn execute_resolves_after_engine_ack() {
        let engine = Arc::new(ScriptedEngine::new());
        let (handle, _root) = spawn(Arc::clone(&engine));

        let reply = handle.act(UserAction::Execute).await.expect("execute");
        assert_eq!(reply, ActionReply::Dispatched { ticket: 1 });
        assert_eq!(handle.snapshot().iteration.status, IterationStatus::Running);
        assert_eq!(engine.commands().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn engine_failure_reaches_caller_and_rolls_back() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_failure(EngineError::Unavailable("down".to_string()));
        let (handle, _root) = spawn(Arc::clone(&engine));

        let err = handle.act(UserAction::Execute).await.expect_err("failure");
        assert_eq!(
            err,
            ActorError::Engine(EngineError::Unavailable("down".to_string()))
        );
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.iteration.status, IterationStatus::Draft);
        assert!(!snapshot.tentative);
        handle.shutdown().await;
    }

    /// Envelopes keep folding while a command is outstanding.
    #[tokio::test]
    async fn envelopes_flow_while_command_is_held() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.hold();
        let (handle, _root) = spawn(Arc::clone(&engine));

        let submitted = handle.submit(UserAction::Execute).await.expect("accepted");
        assert!(submitted.is_dispatched());
        assert!(handle.snapshot().tentative);

        handle
            .send_envelope(lifecycle::started("it-1"))
            .await
            .expect("send");
        handle
            .deliver(agent_event("orchestrator", "working"))
            .await
            .expect("deliver");
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.transcript.len(), 1);
        assert!(!snapshot.tentative);

        engine.release(1);
        let reply = submitted.completion().await.expect("engine ack");
        assert!(matches!(reply, ActionReply::Dispatched { .. }));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_action_returns_session_error() {
        let engine = Arc::new(ScriptedEngine::new());
        let (handle, _root) = spawn(engine);
        let err = handle.act(UserAction::Retry).await.expect_err("draft");
        assert!(matches!(err, ActorError::Session(SessionError::Lifecycle(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn parent_cancellation_stops_actor() {
        let engine = Arc::new(ScriptedEngine::new());
        let (handle, root) = spawn(engine);
        root.cancel();
        let mut snapshots = handle.subscribe();
        // The watch sender is dropped with the actor.
        while snapshots.changed().await.is_ok() {}
        let err = handle
            .send_envelope(lifecycle::started("it-1"))
            .await
            .expect_err("closed");
        assert_eq!(err, ActorError::Closed("it-1".to_string()));
    }
}
