//! The fixed pipeline stage order and stage-start detection.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One step of the pipeline. Declaration order is the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKey {
    Idea,
    Prd,
    Design,
    Plan,
    Coding,
    Check,
    Delivery,
}

impl StageKey {
    /// Every stage, in pipeline order.
    pub const ALL: [StageKey; 7] = [
        StageKey::Idea,
        StageKey::Prd,
        StageKey::Design,
        StageKey::Plan,
        StageKey::Coding,
        StageKey::Check,
        StageKey::Delivery,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn first() -> Self {
        StageKey::Idea
    }

    /// Zero-based position in the pipeline.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKey::Idea => "idea",
            StageKey::Prd => "prd",
            StageKey::Design => "design",
            StageKey::Plan => "plan",
            StageKey::Coding => "coding",
            StageKey::Check => "check",
            StageKey::Delivery => "delivery",
        }
    }

    /// Human label used in prompts and summaries.
    pub fn display_name(self) -> &'static str {
        match self {
            StageKey::Idea => "Idea",
            StageKey::Prd => "PRD",
            StageKey::Design => "Design",
            StageKey::Plan => "Plan",
            StageKey::Coding => "Coding",
            StageKey::Check => "Check",
            StageKey::Delivery => "Delivery",
        }
    }

    /// Stages strictly before `self`, in order.
    pub fn earlier(self) -> &'static [StageKey] {
        &Self::ALL[..self.index()]
    }

    pub fn next(self) -> Option<StageKey> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageKey {
    type Err = UnknownStage;

    /// Accepts the key (`prd`) or the display name (`PRD`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        StageKey::ALL
            .into_iter()
            .find(|stage| {
                stage.as_str().eq_ignore_ascii_case(wanted)
                    || stage.display_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

static STAGE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)starting stage:\s*([a-z]+)").expect("stage start pattern is valid")
});

/// Detect a stage-start announcement inside agent content.
///
/// The engine announces each stage with `Starting stage: <stage>`; anything
/// that does not name a known stage is ignored.
pub fn detect_stage_start(content: &str) -> Option<StageKey> {
    let captures = STAGE_START.captures(content)?;
    captures.get(1)?.as_str().parse().ok()
}
