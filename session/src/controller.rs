//! Project controller: owns every session actor of one project.
//!
//! Routes inbound envelopes to the session they belong to, enforces the one
//! Running iteration per project rule, and keeps a read-refreshed copy of the
//! project and its iteration list. The store stays the source of truth; the
//! controller never writes lifecycle state to it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actor::{
    ActorContext, ActorError, SessionEvent, SessionHandle, Submitted, spawn_session,
};
use crate::core::envelope::Inbound;
use crate::core::lifecycle::{Iteration, LifecycleError};
use crate::core::session::{SessionSnapshot, SessionState, UserAction};
use crate::core::types::{IterationStatus, NewIteration, Project};
use crate::io::clock::Clock;
use crate::io::config::SessionConfig;
use crate::io::engine::Engine;
use crate::io::store::{IterationStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] ActorError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("iteration '{0}' is already running in this project")]
    AlreadyRunning(String),
    #[error("iteration '{0}' does not belong to this project")]
    ForeignIteration(String),
}

pub struct Controller {
    project_id: String,
    store: Arc<dyn IterationStore>,
    config: SessionConfig,
    ctx: ActorContext,
    project: Option<Project>,
    iterations: Vec<Iteration>,
    sessions: HashMap<String, SessionHandle>,
    active: Option<String>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        project_id: impl Into<String>,
        store: Arc<dyn IterationStore>,
        engine: Arc<dyn Engine>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let ctx = ActorContext {
            engine,
            clock,
            events,
            buffer: config.envelope_buffer,
        };
        Self {
            project_id: project_id.into(),
            store,
            config,
            ctx,
            project: None,
            iterations: Vec::new(),
            sessions: HashMap::new(),
            active: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    pub fn session(&self, iteration_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(iteration_id)
    }

    pub fn snapshot(&self, iteration_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(iteration_id).map(SessionHandle::snapshot)
    }

    /// Load the project and activate its current iteration, if any.
    #[instrument(skip(self), fields(project = %self.project_id))]
    pub async fn load(&mut self) -> Result<(), ControllerError> {
        self.refresh().await?;
        let current = self
            .project
            .as_ref()
            .and_then(|project| project.current_iteration_id.clone());
        if let Some(id) = current {
            self.activate(&id).await?;
        }
        Ok(())
    }

    /// Re-read the project and its iteration list from the store.
    pub async fn refresh(&mut self) -> Result<(), ControllerError> {
        self.project = Some(self.store.load_project(&self.project_id).await?);
        self.iterations = self.store.list_iterations(&self.project_id).await?;
        debug!(count = self.iterations.len(), "iteration list refreshed");
        Ok(())
    }

    pub async fn rename_project(&mut self, name: &str) -> Result<Project, ControllerError> {
        let project = self.store.rename_project(&self.project_id, name).await?;
        self.project = Some(project.clone());
        Ok(project)
    }

    /// Make `iteration_id` the active iteration. The previous active session
    /// is torn down and the new one is rebuilt from the store.
    #[instrument(skip(self), fields(project = %self.project_id))]
    pub async fn activate(&mut self, iteration_id: &str) -> Result<SessionSnapshot, ControllerError> {
        if let Some(previous) = self.active.take()
            && let Some(handle) = self.sessions.remove(&previous)
        {
            handle.shutdown().await;
        }
        if let Some(handle) = self.sessions.remove(iteration_id) {
            handle.shutdown().await;
        }
        let handle = self.spawn_from_store(iteration_id).await?;
        let snapshot = handle.snapshot();
        self.sessions.insert(iteration_id.to_string(), handle);
        self.active = Some(iteration_id.to_string());
        self.store
            .set_current_iteration(&self.project_id, Some(iteration_id))
            .await?;
        self.refresh().await?;
        info!(iteration = %iteration_id, "iteration activated");
        Ok(snapshot)
    }

    /// Deliver one envelope to the session it belongs to.
    ///
    /// Envelopes without an iteration id go to the Running iteration and are
    /// dropped when there is none.
    #[instrument(skip(self, inbound), fields(project = %self.project_id, event = inbound.envelope.name()))]
    pub async fn route(&mut self, inbound: Inbound) -> Result<(), ControllerError> {
        if inbound.envelope.resets_project() {
            info!("project reset; rebuilding sessions from store");
            return self.resync().await;
        }

        let target = match inbound.target() {
            Some(id) => Some(id.to_string()),
            None => self.running_iteration(),
        };

        match target {
            Some(id) => {
                if !self.sessions.contains_key(&id) {
                    if !self.iterations.iter().any(|iteration| iteration.id == id) {
                        self.refresh().await?;
                    }
                    match self.spawn_from_store(&id).await {
                        Ok(handle) => {
                            self.sessions.insert(id.clone(), handle);
                        }
                        Err(ControllerError::Store(StoreError::IterationNotFound(_))) => {
                            warn!(iteration = %id, "envelope for unknown iteration dropped");
                            return self.refresh_if_needed(&inbound).await;
                        }
                        Err(err) => return Err(err),
                    }
                }
                if let Some(handle) = self.sessions.get(&id) {
                    // Terminal envelopes are committed before the list
                    // refresh so the Running check never sees stale state.
                    if inbound.envelope.refreshes_iteration_list() {
                        handle.deliver(inbound.envelope.clone()).await?;
                    } else {
                        handle.send_envelope(inbound.envelope.clone()).await?;
                    }
                }
            }
            None if inbound.envelope.refreshes_iteration_list() => {}
            None => warn!("envelope without iteration and nothing running; dropped"),
        }

        self.refresh_if_needed(&inbound).await
    }

    pub async fn create_iteration(
        &mut self,
        form: NewIteration,
    ) -> Result<SessionSnapshot, ControllerError> {
        let iteration = self.store.create_iteration(&self.project_id, form).await?;
        info!(iteration = %iteration.id, sequence = iteration.sequence, "iteration created");
        self.activate(&iteration.id).await
    }

    /// Delete an iteration. Forbidden while it is Running; never cascades.
    pub async fn delete_iteration(&mut self, iteration_id: &str) -> Result<(), ControllerError> {
        let iteration = self.current_view(iteration_id).await?;
        iteration.check_deletable()?;
        if let Some(handle) = self.sessions.remove(iteration_id) {
            handle.shutdown().await;
        }
        if self.active.as_deref() == Some(iteration_id) {
            self.active = None;
        }
        self.store.delete_iteration(iteration_id).await?;
        info!(iteration = %iteration_id, "iteration deleted");
        self.refresh().await
    }

    pub async fn execute(&mut self, iteration_id: &str) -> Result<Submitted, ControllerError> {
        self.act(iteration_id, UserAction::Execute).await
    }

    pub async fn continue_iteration(
        &mut self,
        iteration_id: &str,
    ) -> Result<Submitted, ControllerError> {
        self.act(iteration_id, UserAction::Continue).await
    }

    pub async fn retry(&mut self, iteration_id: &str) -> Result<Submitted, ControllerError> {
        self.act(iteration_id, UserAction::Retry).await
    }

    /// Hand a human action to the iteration's session.
    ///
    /// Returns once the session has accepted it. The engine's answer to a
    /// dispatched command arrives through [`Submitted::completion`], which
    /// does not borrow the controller, so envelopes can be routed meanwhile.
    /// Actions that start a run are refused while another iteration runs.
    pub async fn act(
        &mut self,
        iteration_id: &str,
        action: UserAction,
    ) -> Result<Submitted, ControllerError> {
        if action.starts_run() {
            self.ensure_nothing_running()?;
        }
        if !self.sessions.contains_key(iteration_id) {
            let handle = self.spawn_from_store(iteration_id).await?;
            self.sessions.insert(iteration_id.to_string(), handle);
        }
        let handle = self
            .sessions
            .get(iteration_id)
            .ok_or_else(|| ActorError::Closed(iteration_id.to_string()))?;
        Ok(handle.submit(action).await?)
    }

    /// Tear down every session and re-activate the project's current iteration.
    pub async fn resync(&mut self) -> Result<(), ControllerError> {
        for (_, handle) in self.sessions.drain() {
            handle.shutdown().await;
        }
        self.active = None;
        self.load().await
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for (_, handle) in self.sessions.drain() {
            handle.shutdown().await;
        }
    }

    /// Running iteration by live session state first, then by store state.
    fn running_iteration(&self) -> Option<String> {
        self.iterations
            .iter()
            .map(|iteration| match self.sessions.get(&iteration.id) {
                Some(handle) => (iteration.id.clone(), handle.snapshot().iteration.status),
                None => (iteration.id.clone(), iteration.status),
            })
            .chain(
                self.sessions
                    .values()
                    .filter(|handle| {
                        !self
                            .iterations
                            .iter()
                            .any(|iteration| iteration.id == handle.iteration_id())
                    })
                    .map(|handle| {
                        (
                            handle.iteration_id().to_string(),
                            handle.snapshot().iteration.status,
                        )
                    }),
            )
            .find(|(_, status)| *status == IterationStatus::Running)
            .map(|(id, _)| id)
    }

    fn ensure_nothing_running(&self) -> Result<(), ControllerError> {
        match self.running_iteration() {
            Some(running) => Err(ControllerError::AlreadyRunning(running)),
            None => Ok(()),
        }
    }

    /// Live iteration state when a session exists, stored state otherwise.
    async fn current_view(&self, iteration_id: &str) -> Result<Iteration, ControllerError> {
        match self.sessions.get(iteration_id) {
            Some(handle) => Ok(handle.snapshot().iteration),
            None => Ok(self.store.load_iteration(iteration_id).await?),
        }
    }

    async fn spawn_from_store(&self, iteration_id: &str) -> Result<SessionHandle, ControllerError> {
        let iteration = self.store.load_iteration(iteration_id).await?;
        if iteration.project_id != self.project_id {
            return Err(ControllerError::ForeignIteration(iteration_id.to_string()));
        }
        let transcript = self.store.load_transcript(iteration_id).await?;
        let state =
            SessionState::with_transcript(iteration, transcript, &self.config.session_options());
        debug!(iteration = %iteration_id, "session rebuilt from store");
        Ok(spawn_session(state, self.ctx.clone(), &self.cancel))
    }

    async fn refresh_if_needed(&mut self, inbound: &Inbound) -> Result<(), ControllerError> {
        if inbound.envelope.refreshes_iteration_list() {
            self.refresh().await?;
        }
        Ok(())
    }
}
