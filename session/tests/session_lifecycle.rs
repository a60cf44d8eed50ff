//! End-to-end session flows driven through the actor.

use std::sync::Arc;

use session::actor::{ActorContext, ActorError, SessionEvent, SessionHandle, spawn_session};
use session::core::envelope::{Command, Envelope};
use session::core::input_request::Phase;
use session::core::pm::{OverlapPolicy, PmAction, PmError};
use session::core::session::{ActionReply, SessionError, SessionOptions, SessionState, UserAction};
use session::core::stage::StageKey;
use session::core::types::{IterationStatus, PmReply, ResponseType};
use session::test_support::{
    FixedClock, ScriptedEngine, agent_event, artifact_input, draft_iteration, lifecycle,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: Arc<ScriptedEngine>,
    events: broadcast::Receiver<SessionEvent>,
    handle: SessionHandle,
    _root: CancellationToken,
}

fn harness(options: SessionOptions) -> Harness {
    let engine = Arc::new(ScriptedEngine::new());
    let (events_tx, events) = broadcast::channel(16);
    let ctx = ActorContext {
        engine: engine.clone(),
        clock: Arc::new(FixedClock::default()),
        events: events_tx,
        buffer: 16,
    };
    let root = CancellationToken::new();
    let state = SessionState::new(draft_iteration("it-1"), &options);
    let handle = spawn_session(state, ctx, &root);
    Harness {
        engine,
        events,
        handle,
        _root: root,
    }
}

async fn send_all(handle: &SessionHandle, envelopes: Vec<Envelope>) {
    for envelope in envelopes {
        handle.send_envelope(envelope).await.expect("send envelope");
    }
}

/// Drive an iteration to Completed.
async fn complete(h: &Harness) {
    h.handle.act(UserAction::Execute).await.expect("execute");
    send_all(
        &h.handle,
        vec![lifecycle::started("it-1"), lifecycle::completed("it-1")],
    )
    .await;
    h.handle
        .wait_for(|s| s.iteration.status == IterationStatus::Completed)
        .await
        .expect("completed");
}

/// Draft → execute → design stage → artifact feedback round trip.
#[tokio::test]
async fn execute_then_artifact_feedback() {
    let mut h = harness(SessionOptions::default());

    let reply = h.handle.act(UserAction::Execute).await.expect("execute");
    assert!(matches!(reply, ActionReply::Dispatched { .. }));
    assert_eq!(
        h.engine.commands(),
        vec![Command::Execute {
            iteration_id: "it-1".to_string()
        }]
    );

    send_all(
        &h.handle,
        vec![
            lifecycle::started("it-1"),
            agent_event("orchestrator", "Starting stage: design"),
            artifact_input("r1", "design"),
        ],
    )
    .await;
    let snapshot = h
        .handle
        .wait_for(|s| s.input_request.is_some())
        .await
        .expect("request");
    assert_eq!(snapshot.iteration.status, IterationStatus::Running);
    assert_eq!(snapshot.iteration.current_stage, Some(StageKey::Design));
    assert_eq!(snapshot.progress_percent, 29);
    assert_eq!(
        snapshot.displayed_completed_stages,
        vec![StageKey::Idea, StageKey::Prd]
    );
    let request = snapshot.input_request.expect("request");
    assert!(request.is_artifact_confirmation);
    assert_eq!(request.prompt, "Review the design");

    let reply = h
        .handle
        .act(UserAction::SelectOption {
            request_id: "r1".to_string(),
            option_id: "view".to_string(),
        })
        .await
        .expect("view");
    assert_eq!(
        reply,
        ActionReply::ViewArtifact {
            artifact_type: "design".to_string()
        }
    );
    assert_eq!(
        h.events.recv().await.expect("event"),
        SessionEvent::ShowArtifact {
            iteration_id: "it-1".to_string(),
            artifact_type: "design".to_string(),
        }
    );

    let reply = h
        .handle
        .act(UserAction::SelectOption {
            request_id: "r1".to_string(),
            option_id: "feedback".to_string(),
        })
        .await
        .expect("feedback mode");
    assert_eq!(reply, ActionReply::FeedbackRequested);
    let request = h.handle.snapshot().input_request.expect("still pending");
    assert_eq!(request.phase, Phase::FeedbackPending);
    assert!(request.options.is_empty());

    h.handle
        .act(UserAction::SubmitFeedback {
            request_id: "r1".to_string(),
            text: "  add more detail ".to_string(),
        })
        .await
        .expect("submit");

    let snapshot = h.handle.snapshot();
    assert!(snapshot.input_request.is_none());
    assert_eq!(
        h.engine.commands().last(),
        Some(&Command::SubmitInputResponse {
            request_id: "r1".to_string(),
            response: "💬 Feedback:\nadd more detail".to_string(),
            response_type: ResponseType::Text,
        })
    );
    let last = snapshot.transcript.last().expect("echo");
    assert_eq!(last.content(), "💬 Feedback:\nadd more detail");
    h.handle.shutdown().await;
}

/// A stale request id is refused without touching the pending request.
#[tokio::test]
async fn stale_request_id_is_rejected() {
    let h = harness(SessionOptions::default());
    h.handle.act(UserAction::Execute).await.expect("execute");
    send_all(
        &h.handle,
        vec![lifecycle::started("it-1"), artifact_input("r2", "prd")],
    )
    .await;
    h.handle
        .wait_for(|s| s.input_request.is_some())
        .await
        .expect("request");

    let err = h
        .handle
        .act(UserAction::SelectOption {
            request_id: "r1".to_string(),
            option_id: "approve".to_string(),
        })
        .await
        .expect_err("stale");
    assert!(matches!(err, ActorError::Session(SessionError::Coordinator(_))));
    assert!(h.handle.snapshot().input_request.is_some());
    h.handle.shutdown().await;
}

/// Failure mid-run keeps the request from outliving the iteration.
#[tokio::test]
async fn failure_cancels_pending_request() {
    let h = harness(SessionOptions::default());
    h.handle.act(UserAction::Execute).await.expect("execute");
    send_all(
        &h.handle,
        vec![
            lifecycle::started("it-1"),
            artifact_input("r1", "prd"),
            lifecycle::failed("it-1", "agent crashed"),
        ],
    )
    .await;
    let snapshot = h
        .handle
        .wait_for(|s| s.iteration.status == IterationStatus::Failed)
        .await
        .expect("failed");
    assert!(snapshot.input_request.is_none());
    assert_eq!(snapshot.iteration.error.as_deref(), Some("agent crashed"));

    h.handle.act(UserAction::Retry).await.expect("retry");
    assert_eq!(h.handle.snapshot().iteration.status, IterationStatus::Running);
    h.handle.shutdown().await;
}

#[tokio::test]
async fn pm_chat_requires_completion() {
    let h = harness(SessionOptions::default());
    let err = h
        .handle
        .act(UserAction::SendPmMessage {
            message: "hello".to_string(),
        })
        .await
        .expect_err("draft");
    assert_eq!(
        err,
        ActorError::Session(SessionError::Pm(PmError::NotAvailable(
            IterationStatus::Draft
        )))
    );
    h.handle.shutdown().await;
}

/// Each message yields one reply; history carries earlier turns only.
#[tokio::test]
async fn pm_turns_accumulate_history() {
    let h = harness(SessionOptions::default());
    complete(&h).await;

    h.engine.push_pm_reply(PmReply {
        message: "first answer".to_string(),
        actions: Vec::new(),
    });
    h.handle
        .act(UserAction::SendPmMessage {
            message: "first".to_string(),
        })
        .await
        .expect("first");
    h.handle
        .act(UserAction::SendPmMessage {
            message: "second".to_string(),
        })
        .await
        .expect("second");

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.pm.turns.len(), 4);
    assert!(!snapshot.pm.busy);
    let Some(Command::SendPmMessage { history, .. }) = h.engine.commands().last().cloned() else {
        panic!("expected pm command");
    };
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "first answer");
    h.handle.shutdown().await;
}

#[tokio::test]
async fn overlapping_pm_send_is_rejected_by_default() {
    let h = harness(SessionOptions::default());
    complete(&h).await;
    h.engine.hold();

    let (first, second) = tokio::join!(
        h.handle.act(UserAction::SendPmMessage {
            message: "one".to_string(),
        }),
        async {
            h.handle
                .wait_for(|s| s.pm.busy)
                .await
                .expect("busy");
            let second = h
                .handle
                .act(UserAction::SendPmMessage {
                    message: "two".to_string(),
                })
                .await;
            h.engine.release(1);
            second
        }
    );

    first.expect("first send");
    assert_eq!(
        second.expect_err("overlap"),
        ActorError::Session(SessionError::Pm(PmError::Busy))
    );
    h.handle.shutdown().await;
}

#[tokio::test]
async fn queued_pm_send_dispatches_after_reply() {
    let options = SessionOptions {
        pm_overlap: OverlapPolicy::Queue,
        ..SessionOptions::default()
    };
    let h = harness(options);
    complete(&h).await;
    h.engine.hold();

    let (first, second) = tokio::join!(
        h.handle.act(UserAction::SendPmMessage {
            message: "one".to_string(),
        }),
        async {
            h.handle
                .wait_for(|s| s.pm.busy)
                .await
                .expect("busy");
            let second = h
                .handle
                .act(UserAction::SendPmMessage {
                    message: "two".to_string(),
                })
                .await;
            h.engine.release(2);
            second
        }
    );

    first.expect("first send");
    assert_eq!(second.expect("queued"), ActionReply::Queued { position: 1 });
    let snapshot = h
        .handle
        .wait_for(|s| s.pm.turns.len() == 4 && !s.pm.busy)
        .await
        .expect("both answered");
    assert_eq!(snapshot.pm.queued, 0);
    let pm_commands = h
        .engine
        .commands()
        .into_iter()
        .filter(|command| matches!(command, Command::SendPmMessage { .. }))
        .count();
    assert_eq!(pm_commands, 2);
    h.handle.shutdown().await;
}

/// goto_stage needs confirmation, then restarts the iteration.
#[tokio::test]
async fn goto_stage_confirmation_restarts() {
    let h = harness(SessionOptions::default());
    complete(&h).await;

    let reply = h
        .handle
        .act(UserAction::ApplyPmAction {
            action: PmAction::GotoStage {
                target_stage: StageKey::Plan,
            },
        })
        .await
        .expect("propose");
    assert!(matches!(
        reply,
        ActionReply::NeedsConfirmation {
            target_stage: StageKey::Plan,
            ..
        }
    ));
    assert!(
        !h.engine
            .commands()
            .iter()
            .any(|command| matches!(command, Command::RestartFromStage { .. }))
    );

    h.handle.act(UserAction::ConfirmGoto).await.expect("confirm");
    assert_eq!(
        h.engine.commands().last(),
        Some(&Command::RestartFromStage {
            iteration_id: "it-1".to_string(),
            target_stage: StageKey::Plan,
        })
    );
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.iteration.status, IterationStatus::Running);
    assert_eq!(snapshot.progress_percent, 43);
    h.handle.shutdown().await;
}
