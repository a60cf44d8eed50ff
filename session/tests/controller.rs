//! Project-level flows: routing, follow-up iterations, list refreshes and
//! the one-Running-iteration rule.

use std::sync::Arc;

use session::actor::SessionEvent;
use session::controller::Controller;
use session::controller::ControllerError;
use session::core::envelope::{Command, Envelope, Inbound};
use session::core::lifecycle::{Iteration, LifecycleEvent};
use session::core::pm::PmAction;
use session::core::session::{ActionReply, UserAction};
use session::core::stage::StageKey;
use session::core::types::{IterationStatus, NewIteration};
use session::io::config::SessionConfig;
use session::io::store::{IterationStore, MemoryStore};
use session::test_support::{
    FixedClock, ScriptedEngine, agent_event, at, completed_iteration, lifecycle, running_iteration,
};

async fn controller() -> (Controller, Arc<MemoryStore>) {
    controller_with(Arc::new(ScriptedEngine::new())).await
}

async fn controller_with(engine: Arc<ScriptedEngine>) -> (Controller, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.insert_project("p", "Demo", at(0)).await;
    let mut controller = Controller::new(
        "p",
        store.clone(),
        engine,
        Arc::new(FixedClock::default()),
        SessionConfig::default(),
    );
    controller.load().await.expect("load");
    (controller, store)
}

fn form(title: &str) -> NewIteration {
    NewIteration {
        title: title.to_string(),
        ..NewIteration::default()
    }
}

async fn started(controller: &mut Controller, title: &str) -> String {
    let id = controller
        .create_iteration(form(title))
        .await
        .expect("create")
        .iteration
        .id;
    controller
        .execute(&id)
        .await
        .expect("execute")
        .completion()
        .await
        .expect("engine ack");
    controller
        .route(Inbound::new(None, lifecycle::started(&id)))
        .await
        .expect("route started");
    id
}

/// Untagged agent output lands on the Running iteration.
#[tokio::test]
async fn untagged_envelopes_reach_running_iteration() {
    let (mut controller, _store) = controller().await;
    let id = started(&mut controller, "one").await;

    controller
        .route(Inbound::new(
            None,
            agent_event("orchestrator", "Starting stage: prd"),
        ))
        .await
        .expect("route");

    let snapshot = controller
        .session(&id)
        .expect("session")
        .wait_for(|s| s.iteration.current_stage == Some(StageKey::Prd))
        .await
        .expect("stage");
    assert_eq!(snapshot.progress_percent, 14);
    assert_eq!(snapshot.transcript.len(), 1);
    controller.shutdown().await;
}

/// A completed iteration can spawn a follow-up based on it.
#[tokio::test]
async fn completed_iteration_offers_follow_up() {
    let (mut controller, _store) = controller().await;
    let mut events = controller.subscribe();
    let id = started(&mut controller, "one").await;
    controller
        .route(Inbound::new(None, lifecycle::completed(&id)))
        .await
        .expect("route completed");
    controller
        .session(&id)
        .expect("session")
        .wait_for(|s| s.iteration.status == IterationStatus::Completed)
        .await
        .expect("completed");

    let reply = controller
        .act(
            &id,
            UserAction::ApplyPmAction {
                action: PmAction::CreateIteration { target_stage: None },
            },
        )
        .await
        .expect("pm action");
    assert_eq!(reply.reply(), &ActionReply::CreateIteration);
    assert!(!reply.is_dispatched());

    let event = loop {
        match events.recv().await.expect("event") {
            SessionEvent::CreateIteration { base_iteration_id } => break base_iteration_id,
            _ => continue,
        }
    };
    assert_eq!(event, id);

    let follow_up = controller
        .create_iteration(NewIteration {
            base_iteration_id: Some(id.clone()),
            ..form("two")
        })
        .await
        .expect("follow-up");
    assert_eq!(follow_up.iteration.sequence, 2);
    assert_eq!(follow_up.iteration.base_iteration_id.as_deref(), Some(id.as_str()));
    assert_eq!(follow_up.iteration.status, IterationStatus::Draft);
    assert_eq!(controller.active_id(), Some(follow_up.iteration.id.as_str()));
    controller.shutdown().await;
}

/// Iterations created by the engine show up after `iteration_created`.
#[tokio::test]
async fn iteration_created_refreshes_list() {
    let (mut controller, store) = controller().await;
    assert!(controller.iterations().is_empty());

    store
        .create_iteration("p", form("from engine"))
        .await
        .expect("create");
    controller
        .route(Inbound::new(None, Envelope::IterationCreated))
        .await
        .expect("route");

    assert_eq!(controller.iterations().len(), 1);
    assert_eq!(controller.iterations()[0].title, "from engine");
    controller.shutdown().await;
}

#[tokio::test]
async fn rename_project_updates_cached_project() {
    let (mut controller, _store) = controller().await;
    controller.rename_project("Renamed").await.expect("rename");
    assert_eq!(controller.project().expect("project").name, "Renamed");
    controller.shutdown().await;
}

/// Store an iteration of project `p` the controller has not seen yet.
async fn stored(controller: &mut Controller, store: &MemoryStore, iteration: Iteration) -> String {
    let id = iteration.id.clone();
    store.save_iteration(iteration).await;
    controller.refresh().await.expect("refresh");
    id
}

/// Envelopes are routed while a command waits for the engine's answer.
#[tokio::test]
async fn routing_continues_while_command_is_outstanding() {
    let engine = Arc::new(ScriptedEngine::new());
    let (mut controller, _store) = controller_with(engine.clone()).await;
    let id = controller
        .create_iteration(form("one"))
        .await
        .expect("create")
        .iteration
        .id;
    engine.hold();

    let submitted = controller.execute(&id).await.expect("accepted");
    assert!(submitted.is_dispatched());
    controller
        .route(Inbound::new(None, lifecycle::started(&id)))
        .await
        .expect("route started");
    controller
        .route(Inbound::new(
            None,
            agent_event("orchestrator", "Starting stage: prd"),
        ))
        .await
        .expect("route content");
    let snapshot = controller
        .session(&id)
        .expect("session")
        .wait_for(|s| s.iteration.current_stage == Some(StageKey::Prd))
        .await
        .expect("stage");
    assert!(!snapshot.tentative);

    engine.release(1);
    submitted.completion().await.expect("engine ack");
    assert_eq!(
        engine.commands(),
        vec![Command::Execute {
            iteration_id: id.clone()
        }]
    );
    controller.shutdown().await;
}

/// A completion routed just before an execute is already visible to the
/// Running check.
#[tokio::test]
async fn execute_after_routed_completion_is_allowed() {
    let (mut controller, _store) = controller().await;
    let a = controller
        .create_iteration(form("a"))
        .await
        .expect("a")
        .iteration
        .id;
    let b = controller
        .create_iteration(form("b"))
        .await
        .expect("b")
        .iteration
        .id;

    controller.execute(&a).await.expect("execute a");
    controller
        .route(Inbound::new(None, lifecycle::started(&a)))
        .await
        .expect("started");
    controller
        .route(Inbound::new(None, lifecycle::completed(&a)))
        .await
        .expect("completed");

    let submitted = controller.execute(&b).await.expect("execute b");
    assert!(submitted.is_dispatched());
    controller.shutdown().await;
}

#[tokio::test]
async fn retry_is_refused_while_another_iteration_runs() {
    let (mut controller, store) = controller().await;
    let mut failed = running_iteration("p-it-9");
    failed
        .transition(&LifecycleEvent::Failed("crash".to_string()), at(0))
        .expect("fail");
    let failed = stored(&mut controller, &store, failed).await;
    let running = started(&mut controller, "one").await;

    let err = controller.retry(&failed).await.expect_err("already running");
    assert_eq!(err, ControllerError::AlreadyRunning(running));
    controller.shutdown().await;
}

#[tokio::test]
async fn continue_is_refused_while_another_iteration_runs() {
    let (mut controller, store) = controller().await;
    let mut paused = running_iteration("p-it-9");
    paused.status = IterationStatus::Paused;
    let paused = stored(&mut controller, &store, paused).await;
    let running = started(&mut controller, "one").await;

    let err = controller
        .continue_iteration(&paused)
        .await
        .expect_err("already running");
    assert_eq!(err, ControllerError::AlreadyRunning(running));
    controller.shutdown().await;
}

/// A confirmed stage jump restarts the iteration, so it obeys the same
/// single-Running rule as execute.
#[tokio::test]
async fn confirmed_goto_is_refused_while_another_iteration_runs() {
    let engine = Arc::new(ScriptedEngine::new());
    let (mut controller, store) = controller_with(engine.clone()).await;
    let done = stored(&mut controller, &store, completed_iteration("p-it-9")).await;
    let running = started(&mut controller, "one").await;

    let proposed = controller
        .act(
            &done,
            UserAction::ApplyPmAction {
                action: PmAction::GotoStage {
                    target_stage: StageKey::Plan,
                },
            },
        )
        .await
        .expect("propose");
    assert!(matches!(
        proposed.reply(),
        ActionReply::NeedsConfirmation { .. }
    ));

    let err = controller
        .act(&done, UserAction::ConfirmGoto)
        .await
        .expect_err("already running");
    assert_eq!(err, ControllerError::AlreadyRunning(running));
    let snapshot = controller.snapshot(&done).expect("session");
    assert_eq!(snapshot.iteration.status, IterationStatus::Completed);
    assert!(
        !engine
            .commands()
            .iter()
            .any(|command| matches!(command, Command::RestartFromStage { .. }))
    );
    controller.shutdown().await;
}
