//! Iteration store: the external source of truth for projects, iterations
//! and persisted transcripts.
//!
//! Sessions only ever read from it to rebuild state; lifecycle changes reach
//! it through the engine, not through this crate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::lifecycle::Iteration;
use crate::core::transcript::Transcript;
use crate::core::types::{NewIteration, Project};
use crate::io::clock::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),
    #[error("iteration '{0}' not found")]
    IterationNotFound(String),
    #[error("base iteration '{0}' not found")]
    BaseNotFound(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IterationStore: Send + Sync {
    async fn load_project(&self, project_id: &str) -> Result<Project, StoreError>;

    async fn rename_project(&self, project_id: &str, name: &str) -> Result<Project, StoreError>;

    /// Iterations of a project ordered by sequence.
    async fn list_iterations(&self, project_id: &str) -> Result<Vec<Iteration>, StoreError>;

    async fn load_iteration(&self, iteration_id: &str) -> Result<Iteration, StoreError>;

    /// Persisted transcript; empty when none was saved.
    async fn load_transcript(&self, iteration_id: &str) -> Result<Transcript, StoreError>;

    /// Create a Draft iteration and make it the project's current one.
    async fn create_iteration(
        &self,
        project_id: &str,
        form: NewIteration,
    ) -> Result<Iteration, StoreError>;

    /// Remove one iteration. Iterations based on it are left untouched.
    async fn delete_iteration(&self, iteration_id: &str) -> Result<(), StoreError>;

    async fn set_current_iteration(
        &self,
        project_id: &str,
        iteration_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<String, Project>,
    iterations: BTreeMap<String, Iteration>,
    transcripts: HashMap<String, Transcript>,
}

/// In-process store used by tests and the CLI.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store stamping `created_at` / `updated_at` from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    pub async fn insert_project(&self, id: &str, name: &str, now: DateTime<Utc>) -> Project {
        let project = Project {
            id: id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            current_iteration_id: None,
        };
        let mut inner = self.inner.lock().await;
        inner.projects.insert(id.to_string(), project.clone());
        project
    }

    /// Overwrite an iteration as the engine would after progressing it.
    pub async fn save_iteration(&self, iteration: Iteration) {
        let mut inner = self.inner.lock().await;
        inner.iterations.insert(iteration.id.clone(), iteration);
    }

    pub async fn save_transcript(&self, iteration_id: &str, transcript: Transcript) {
        let mut inner = self.inner.lock().await;
        inner
            .transcripts
            .insert(iteration_id.to_string(), transcript);
    }
}

#[async_trait]
impl IterationStore for MemoryStore {
    async fn load_project(&self, project_id: &str) -> Result<Project, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))
    }

    async fn rename_project(&self, project_id: &str, name: &str) -> Result<Project, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Empty("project name"));
        }
        let mut inner = self.inner.lock().await;
        let project = inner
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
        project.name = name.to_string();
        project.updated_at = self.clock.now();
        Ok(project.clone())
    }

    async fn list_iterations(&self, project_id: &str) -> Result<Vec<Iteration>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.projects.contains_key(project_id) {
            return Err(StoreError::ProjectNotFound(project_id.to_string()));
        }
        let mut iterations: Vec<Iteration> = inner
            .iterations
            .values()
            .filter(|iteration| iteration.project_id == project_id)
            .cloned()
            .collect();
        iterations.sort_by_key(|iteration| iteration.sequence);
        Ok(iterations)
    }

    async fn load_iteration(&self, iteration_id: &str) -> Result<Iteration, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .iterations
            .get(iteration_id)
            .cloned()
            .ok_or_else(|| StoreError::IterationNotFound(iteration_id.to_string()))
    }

    async fn load_transcript(&self, iteration_id: &str) -> Result<Transcript, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.iterations.contains_key(iteration_id) {
            return Err(StoreError::IterationNotFound(iteration_id.to_string()));
        }
        Ok(inner
            .transcripts
            .get(iteration_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_iteration(
        &self,
        project_id: &str,
        form: NewIteration,
    ) -> Result<Iteration, StoreError> {
        if form.title.trim().is_empty() {
            return Err(StoreError::Empty("iteration title"));
        }
        let mut inner = self.inner.lock().await;
        if !inner.projects.contains_key(project_id) {
            return Err(StoreError::ProjectNotFound(project_id.to_string()));
        }
        if let Some(base) = &form.base_iteration_id
            && !inner.iterations.contains_key(base)
        {
            return Err(StoreError::BaseNotFound(base.clone()));
        }

        // Sequences are never reused, even after deletes.
        let sequence = inner
            .iterations
            .values()
            .filter(|iteration| iteration.project_id == project_id)
            .map(|iteration| iteration.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let id = format!("{project_id}-it-{sequence}");
        let now = self.clock.now();
        let iteration = Iteration::new(id.clone(), project_id, sequence, form, now);
        inner.iterations.insert(id.clone(), iteration.clone());
        if let Some(project) = inner.projects.get_mut(project_id) {
            project.current_iteration_id = Some(id);
            project.updated_at = now;
        }
        debug!(iteration = %iteration.id, sequence, "iteration created");
        Ok(iteration)
    }

    async fn delete_iteration(&self, iteration_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .iterations
            .remove(iteration_id)
            .ok_or_else(|| StoreError::IterationNotFound(iteration_id.to_string()))?;
        inner.transcripts.remove(iteration_id);
        if let Some(project) = inner.projects.get_mut(&removed.project_id)
            && project.current_iteration_id.as_deref() == Some(iteration_id)
        {
            project.current_iteration_id = None;
            project.updated_at = self.clock.now();
        }
        debug!(iteration = %iteration_id, "iteration deleted");
        Ok(())
    }

    async fn set_current_iteration(
        &self,
        project_id: &str,
        iteration_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = iteration_id
            && !inner.iterations.contains_key(id)
        {
            return Err(StoreError::IterationNotFound(id.to_string()));
        }
        let project = inner
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
        project.current_iteration_id = iteration_id.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedClock, at};

    fn form(title: &str) -> NewIteration {
        NewIteration {
            title: title.to_string(),
            ..NewIteration::default()
        }
    }

    #[tokio::test]
    async fn sequences_are_monotonic_after_delete() {
        let store = MemoryStore::new();
        store.insert_project("p", "Demo", at(0)).await;
        let first = store.create_iteration("p", form("one")).await.expect("one");
        let second = store.create_iteration("p", form("two")).await.expect("two");
        store.delete_iteration(&first.id).await.expect("delete");
        let third = store.create_iteration("p", form("three")).await.expect("three");

        assert_eq!((first.sequence, second.sequence, third.sequence), (1, 2, 3));
        let listed: Vec<_> = store
            .list_iterations("p")
            .await
            .expect("list")
            .into_iter()
            .map(|iteration| iteration.sequence)
            .collect();
        assert_eq!(listed, vec![2, 3]);
    }

    /// Deleting a base leaves its descendants and their lineage pointer.
    #[tokio::test]
    async fn delete_does_not_cascade_and_clears_pointer() {
        let store = MemoryStore::new();
        store.insert_project("p", "Demo", at(0)).await;
        let base = store.create_iteration("p", form("base")).await.expect("base");
        let child = store
            .create_iteration(
                "p",
                NewIteration {
                    base_iteration_id: Some(base.id.clone()),
                    ..form("child")
                },
            )
            .await
            .expect("child");
        store
            .set_current_iteration("p", Some(&base.id))
            .await
            .expect("point at base");

        store.delete_iteration(&base.id).await.expect("delete");

        let project = store.load_project("p").await.expect("project");
        assert_eq!(project.current_iteration_id, None);
        let child = store.load_iteration(&child.id).await.expect("child survives");
        assert_eq!(child.base_iteration_id.as_deref(), Some(base.id.as_str()));
    }

    #[tokio::test]
    async fn rejects_unknown_base_and_empty_title() {
        let store = MemoryStore::new();
        store.insert_project("p", "Demo", at(0)).await;
        let err = store
            .create_iteration(
                "p",
                NewIteration {
                    base_iteration_id: Some("ghost".to_string()),
                    ..form("x")
                },
            )
            .await
            .expect_err("unknown base");
        assert_eq!(err, StoreError::BaseNotFound("ghost".to_string()));
        assert_eq!(
            store.create_iteration("p", form("  ")).await,
            Err(StoreError::Empty("iteration title"))
        );
    }

    #[tokio::test]
    async fn rename_trims_and_bumps_updated_at() {
        let clock = Arc::new(FixedClock::new(at(0)));
        let store = MemoryStore::with_clock(clock.clone());
        store.insert_project("p", "Demo", at(0)).await;
        clock.advance(30);
        let project = store.rename_project("p", "  Atlas ").await.expect("rename");
        assert_eq!(project.name, "Atlas");
        assert_eq!(project.updated_at, at(30));
    }

    #[tokio::test]
    async fn timestamps_come_from_the_store_clock() {
        let clock = Arc::new(FixedClock::new(at(100)));
        let store = MemoryStore::with_clock(clock.clone());
        store.insert_project("p", "Demo", at(0)).await;

        let first = store.create_iteration("p", form("one")).await.expect("one");
        assert_eq!(first.created_at, at(100));
        assert_eq!(store.load_project("p").await.expect("project").updated_at, at(100));

        clock.advance(5);
        store.delete_iteration(&first.id).await.expect("delete");
        let project = store.load_project("p").await.expect("project");
        assert_eq!(project.updated_at, at(105));
        assert_eq!(project.current_iteration_id, None);
    }
}
