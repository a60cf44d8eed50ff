//! Server-Sent Events stream and envelope log watcher.

use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    iteration_id: &'a str,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        match event {
            ChangeEvent::SessionAdded { iteration_id } => SsePayload {
                event_type: "session_added",
                iteration_id,
            },
            ChangeEvent::SessionUpdated { iteration_id } => SsePayload {
                event_type: "session_updated",
                iteration_id,
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    let payload = SsePayload::from(&change_event);
                    if let Ok(json) = serde_json::to_string(&payload) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the log watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    if !state.sessions_dir.exists() {
        std::fs::create_dir_all(&state.sessions_dir)?;
    }
    watcher.watch(&state.sessions_dir, RecursiveMode::Recursive)?;
    info!(path = %state.sessions_dir.display(), "watching sessions directory");

    let mut known: HashSet<String> = state.session_ids().into_iter().collect();

    // Flush on a fixed tick so a log being appended continuously still
    // produces updates.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events, &mut known);
                pending_events.clear();
            }
        }
    }
}

/// Collapse a batch of file events into at most one change per session.
fn process_events(state: &AppState, events: &[NotifyEvent], known: &mut HashSet<String>) {
    let mut added = BTreeSet::new();
    let mut updated = BTreeSet::new();

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            let Some(id) = state.iteration_for(path) else {
                continue;
            };
            if known.insert(id.clone()) {
                added.insert(id);
            } else {
                updated.insert(id);
            }
        }
    }

    for iteration_id in added {
        debug!(iteration = %iteration_id, "broadcasting new session");
        updated.remove(&iteration_id);
        let _ = state.event_tx.send(ChangeEvent::SessionAdded { iteration_id });
    }
    for iteration_id in updated {
        debug!(iteration = %iteration_id, "broadcasting session update");
        let _ = state
            .event_tx
            .send(ChangeEvent::SessionUpdated { iteration_id });
    }
}
