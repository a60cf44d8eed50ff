//! Session configuration stored under `.pipeline/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::input_request::{DEFAULT_FEEDBACK_PROMPT, OptionIds};
use crate::core::pm::OverlapPolicy;
use crate::core::session::SessionOptions;

pub const DEFAULT_CONFIG_PATH: &str = ".pipeline/config.toml";

/// Session configuration (TOML).
///
/// Edited by humans; every field is optional and defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of each session's inbound channel. A full channel
    /// back-pressures the envelope source.
    pub envelope_buffer: usize,

    /// Capacity of the side-event broadcast channel.
    pub event_buffer: usize,

    /// What to do with a post-delivery message sent while a reply is pending.
    pub pm_overlap: OverlapPolicy,

    /// Prompt shown while the human types artifact feedback.
    pub feedback_prompt: String,

    pub options: OptionIds,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            envelope_buffer: 256,
            event_buffer: 64,
            pm_overlap: OverlapPolicy::Reject,
            feedback_prompt: DEFAULT_FEEDBACK_PROMPT.to_string(),
            options: OptionIds::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.envelope_buffer == 0 {
            return Err(anyhow!("envelope_buffer must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be > 0"));
        }
        if self.feedback_prompt.trim().is_empty() {
            return Err(anyhow!("feedback_prompt must not be empty"));
        }
        if self.options.view_artifact.trim().is_empty() || self.options.feedback.trim().is_empty() {
            return Err(anyhow!("options.view_artifact and options.feedback must not be empty"));
        }
        if self.options.view_artifact == self.options.feedback {
            return Err(anyhow!(
                "options.view_artifact and options.feedback must differ (both '{}')",
                self.options.feedback
            ));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            pm_overlap: self.pm_overlap,
            option_ids: self.options.clone(),
            feedback_prompt: self.feedback_prompt.clone(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SessionConfig::default()`.
pub fn load_config(path: &Path) -> Result<SessionConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing; using defaults");
        let cfg = SessionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SessionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SessionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
