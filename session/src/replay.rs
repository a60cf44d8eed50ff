//! Replay an envelope log through a fresh session.
//!
//! The log is folded into a Draft iteration; `iteration_started` acts as the
//! execute that would have preceded it. Used by the CLI and the snapshot
//! server.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::envelope::Inbound;
use crate::core::lifecycle::Iteration;
use crate::core::message::ChatMessage;
use crate::core::session::{SessionOptions, SessionSnapshot, SessionState};
use crate::core::types::NewIteration;
use crate::io::envelope_log::read_log;

/// Iteration id used when neither the caller nor the log names one.
pub const FALLBACK_ITERATION_ID: &str = "replay";

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub snapshot: SessionSnapshot,
    /// Envelopes folded into the session.
    pub applied: usize,
    /// Envelopes addressed to another iteration.
    pub skipped: usize,
}

/// Fold `envelopes` into a fresh session for `iteration_id` (or the first
/// iteration the log names).
pub fn replay_envelopes(
    envelopes: &[Inbound],
    iteration_id: Option<&str>,
    options: &SessionOptions,
    at: DateTime<Utc>,
) -> ReplayReport {
    let id = iteration_id
        .or_else(|| envelopes.iter().find_map(Inbound::target))
        .unwrap_or(FALLBACK_ITERATION_ID)
        .to_string();
    let iteration = Iteration::new(
        id.clone(),
        FALLBACK_ITERATION_ID,
        1,
        NewIteration {
            title: id.clone(),
            ..NewIteration::default()
        },
        at,
    );
    let mut state = SessionState::new(iteration, options);

    let mut applied = 0;
    let mut skipped = 0;
    for inbound in envelopes {
        if inbound.target().is_some_and(|target| target != id) {
            skipped += 1;
            continue;
        }
        state.apply_envelope(&inbound.envelope, at);
        applied += 1;
    }
    debug!(iteration = %id, applied, skipped, "replay finished");

    ReplayReport {
        snapshot: state.snapshot(),
        applied,
        skipped,
    }
}

pub fn replay_file(
    path: &Path,
    iteration_id: Option<&str>,
    options: &SessionOptions,
    at: DateTime<Utc>,
) -> Result<ReplayReport> {
    let envelopes = read_log(path)?;
    Ok(replay_envelopes(&envelopes, iteration_id, options, at))
}

/// Human-readable summary: status line, pending request, transcript.
pub fn render_summary(report: &ReplayReport) -> String {
    let snapshot = &report.snapshot;
    let iteration = &snapshot.iteration;
    let mut out = String::new();

    let stage = iteration
        .current_stage
        .map_or_else(|| "-".to_string(), |stage| stage.display_name().to_string());
    let _ = writeln!(
        out,
        "{} [{:?}] stage: {} progress: {}%",
        iteration.id, iteration.status, stage, snapshot.progress_percent
    );
    if let Some(error) = &iteration.error {
        let _ = writeln!(out, "error: {error}");
    }
    if let Some(request) = &snapshot.input_request {
        let options: Vec<&str> = request
            .options
            .iter()
            .map(|option| option.display_label())
            .collect();
        let _ = writeln!(
            out,
            "pending request {}: {} [{}]",
            request.request_id,
            request.prompt,
            options.join(" | ")
        );
    }
    let _ = writeln!(
        out,
        "{} envelopes applied, {} skipped",
        report.applied, report.skipped
    );
    for message in snapshot.transcript.messages() {
        let _ = writeln!(out, "{}", summary_line(message));
    }
    out
}

fn summary_line(message: &ChatMessage) -> String {
    let text = message.content().replace('\n', " ");
    match message {
        ChatMessage::Agent { agent_name, .. } | ChatMessage::Thinking { agent_name, .. } => {
            format!("  {:<11} {agent_name}: {text}", message.kind())
        }
        ChatMessage::ToolResult { success, .. } => {
            let mark = if *success { "ok" } else { "failed" };
            format!("  {:<11} {text} ({mark})", message.kind())
        }
        _ => format!("  {:<11} {text}", message.kind()),
    }
}
