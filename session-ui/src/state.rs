//! Shared application state for the snapshot server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use session::core::session::SessionOptions;
use session::io::envelope_log::{ENVELOPE_LOG_FILE, log_path};
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when envelope logs change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    SessionAdded { iteration_id: String },
    SessionUpdated { iteration_id: String },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Directory holding one `<iteration_id>/envelopes.jsonl` per session.
    pub sessions_dir: PathBuf,
    pub options: Arc<SessionOptions>,
    /// Broadcast sender for log change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(sessions_dir: PathBuf, options: SessionOptions) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            sessions_dir,
            options: Arc::new(options),
            event_tx: Arc::new(event_tx),
        }
    }

    pub fn log_path(&self, iteration_id: &str) -> PathBuf {
        log_path(&self.sessions_dir, iteration_id)
    }

    /// Iteration ids that currently have an envelope log, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?.to_string();
                path.join(ENVELOPE_LOG_FILE).is_file().then_some(name)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Iteration id owning `path`, if it is an envelope log under the
    /// sessions directory.
    pub fn iteration_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.sessions_dir).ok()?;
        let mut components = rel.components();
        let id = components.next()?.as_os_str().to_str()?.to_string();
        let file = components.next()?.as_os_str().to_str()?;
        (file == ENVELOPE_LOG_FILE && components.next().is_none()).then_some(id)
    }
}
