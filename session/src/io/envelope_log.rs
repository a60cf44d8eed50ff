//! JSON Lines envelope logs (`<dir>/<iteration_id>/envelopes.jsonl`).
//!
//! One envelope per line: `{"event": ..., "iteration_id"?: ..., "payload"?: ...}`.
//! Logs are a debugging and replay aid; a bad line never aborts a read.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::envelope::{Inbound, parse_envelope_str};

pub const ENVELOPE_LOG_FILE: &str = "envelopes.jsonl";

/// Log location for one iteration under a session directory.
pub fn log_path(dir: &Path, iteration_id: &str) -> PathBuf {
    dir.join(iteration_id).join(ENVELOPE_LOG_FILE)
}

/// Parse log text. Blank lines are skipped; malformed lines are logged and
/// skipped.
pub fn parse_log(contents: &str) -> Vec<Inbound> {
    let mut envelopes = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_envelope_str(line) {
            Ok(inbound) => envelopes.push(inbound),
            Err(err) => warn!(line = index + 1, %err, "skipping malformed envelope"),
        }
    }
    envelopes
}

pub fn read_log(path: &Path) -> Result<Vec<Inbound>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read envelope log {}", path.display()))?;
    let envelopes = parse_log(&contents);
    debug!(path = %path.display(), count = envelopes.len(), "envelope log loaded");
    Ok(envelopes)
}
