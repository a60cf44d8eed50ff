//! Iteration invariants not expressible in the type system.

use std::collections::HashSet;

use crate::core::lifecycle::Iteration;
use crate::core::stage::StageKey;
use crate::core::types::IterationStatus;

/// Check iteration invariants:
/// - `current_stage` is absent exactly in Draft and Completed
/// - no duplicate completed stages
/// - Completed has every stage completed
/// - Failed carries an error text
/// - nothing is completed before the iteration started
pub fn validate_iteration(iteration: &Iteration) -> Vec<String> {
    let mut errors = Vec::new();
    let id = iteration.id.as_str();

    let stage_expected = !matches!(
        iteration.status,
        IterationStatus::Draft | IterationStatus::Completed
    );
    match (stage_expected, iteration.current_stage) {
        (true, None) => errors.push(format!(
            "{id}: {:?} iteration must have a current stage",
            iteration.status
        )),
        (false, Some(stage)) => errors.push(format!(
            "{id}: {:?} iteration must not have a current stage (has {stage})",
            iteration.status
        )),
        _ => {}
    }

    let mut seen = HashSet::new();
    for stage in &iteration.completed_stages {
        if !seen.insert(*stage) {
            errors.push(format!("{id}: stage {stage} completed more than once"));
        }
    }

    if iteration.status == IterationStatus::Completed && seen.len() != StageKey::COUNT {
        errors.push(format!(
            "{id}: completed iteration has {} of {} stages done",
            seen.len(),
            StageKey::COUNT
        ));
    }

    if iteration.status == IterationStatus::Failed && iteration.error.is_none() {
        errors.push(format!("{id}: failed iteration must record an error"));
    }

    if iteration.status == IterationStatus::Draft && !iteration.completed_stages.is_empty() {
        errors.push(format!("{id}: draft iteration has completed stages"));
    }

    errors
}
