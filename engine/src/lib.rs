//! Procedure dependency engine for Pitstop.
//!
//! [`DependencyEngine`] holds one loaded procedure session: the completed
//! set, the derived available set, and the active step. Every mutation is
//! persisted through the injected [`ProgressStore`] before it returns; a
//! failed write leaves the in-memory session exactly as it was.
//!
//! The engine never calls into UI or highlighting layers. Callers poll
//! [`DependencyEngine::snapshot`] or register an observer.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

pub use pitstop_store::{ProcedureCatalog, ProgressStore};
pub use pitstop_types::{
    CompletionRecord, EquipmentId, NonEmptyString, Procedure, ProcedureId, ProgressKey, Rating,
    StepId,
};

mod config;
mod error;
mod observer;
mod state;

pub use config::{
    ConfigError, HOME_ENV, PitstopConfig, StorageConfig, StoragePaths, base_dir, config_path,
    expand_env_vars, expand_path,
};
pub use error::{EngineError, NotAvailableReason};
pub use observer::{EngineEvent, SubscriptionId};
pub use state::{EnginePhase, EngineSnapshot};

use observer::Observers;
use state::Session;

static NO_STEPS: BTreeSet<StepId> = BTreeSet::new();

pub struct DependencyEngine {
    catalog: Arc<dyn ProcedureCatalog>,
    progress: Arc<dyn ProgressStore>,
    session: Option<Session>,
    observers: Observers,
}

impl std::fmt::Debug for DependencyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyEngine")
            .field("session", &self.session)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl DependencyEngine {
    pub fn new(catalog: Arc<dyn ProcedureCatalog>, progress: Arc<dyn ProgressStore>) -> Self {
        Self {
            catalog,
            progress,
            session: None,
            observers: Observers::default(),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        self.session
            .as_ref()
            .map_or(EnginePhase::Unloaded, Session::phase)
    }

    #[must_use]
    pub fn procedure(&self) -> Option<&Procedure> {
        self.session.as_ref().map(|s| &s.procedure)
    }

    /// Available steps in stable order; empty when unloaded.
    #[must_use]
    pub fn available(&self) -> &[StepId] {
        self.session
            .as_ref()
            .map(Session::available)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active(&self) -> Option<StepId> {
        self.session.as_ref().and_then(Session::active)
    }

    #[must_use]
    pub fn completed(&self) -> &BTreeSet<StepId> {
        self.session.as_ref().map_or(&NO_STEPS, Session::completed)
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.session
            .as_ref()
            .map_or_else(EngineSnapshot::unloaded, Session::snapshot)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        self.observers.subscribe(Box::new(observer))
    }

    /// Returns `false` if `id` was never issued or is already unsubscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn emit_state_changed(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let event = EngineEvent::StateChanged(self.snapshot());
        self.observers.notify(&event);
    }

    fn emit_completed(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(completed_at) = session.finished_at() else {
            return;
        };
        let event = EngineEvent::ProcedureCompleted {
            equipment_id: session.key.equipment().clone(),
            procedure_id: session.key.procedure().clone(),
            started_at: session.started_at,
            completed_at,
        };
        self.observers.notify(&event);
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start a new session for `procedure` on `equipment`.
    ///
    /// Stored completions that no longer name a step of the procedure are
    /// dropped, and the pruned set is written back. On any failure the
    /// previous session (if any) stays loaded.
    pub fn load(
        &mut self,
        procedure: &ProcedureId,
        equipment: &EquipmentId,
    ) -> Result<(), EngineError> {
        let graph = self.catalog.load_procedure(equipment, procedure)?;
        let key = ProgressKey::new(equipment.clone(), procedure.clone());
        let stored = self.progress.completed_steps(&key)?;

        let completed: BTreeSet<StepId> = stored
            .iter()
            .copied()
            .filter(|&step| graph.contains(step))
            .collect();
        if completed.len() != stored.len() {
            let dropped: Vec<StepId> = stored.difference(&completed).copied().collect();
            debug!(
                equipment = %equipment,
                procedure = %procedure,
                ?dropped,
                "Dropping completed ids missing from procedure"
            );
            self.progress.set_completed_steps(&key, &completed)?;
        }

        let session = Session::new(key, graph, completed, Utc::now());
        info!(
            equipment = %equipment,
            procedure = %procedure,
            completed = session.completed().len(),
            phase = ?session.phase(),
            "Loaded procedure"
        );
        self.session = Some(session);
        self.emit_state_changed();
        Ok(())
    }

    /// Mark an available step completed and persist.
    pub fn complete(&mut self, step: StepId) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NotLoaded)?;
        if !session.is_available(step) {
            return Err(EngineError::NotAvailable {
                step,
                reason: session.unavailable_reason(step),
            });
        }

        let mut completed = session.completed().clone();
        completed.insert(step);
        if let Err(err) = self.progress.set_completed_steps(&session.key, &completed) {
            warn!(step = %step, "Failed to persist completion: {err}");
            return Err(err.into());
        }

        let finished = session.apply(completed, None, Utc::now());
        debug!(
            step = %step,
            active = ?session.active(),
            available = session.available().len(),
            "Completed step"
        );
        if finished {
            info!(key = %session.key, "Procedure completed");
        }
        self.emit_state_changed();
        if finished {
            self.emit_completed();
        }
        Ok(())
    }

    /// Reopen a completed step and make it active.
    ///
    /// Rejected while any completed step still requires it; dependents must
    /// be reopened first.
    pub fn uncomplete(&mut self, step: StepId) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NotLoaded)?;
        if !session.completed().contains(&step) {
            return Err(EngineError::NotCompleted { step });
        }
        let dependents = session
            .procedure
            .completed_dependents(step, session.completed());
        if !dependents.is_empty() {
            return Err(EngineError::DependentsExist { step, dependents });
        }

        let mut completed = session.completed().clone();
        completed.remove(&step);
        if let Err(err) = self.progress.set_completed_steps(&session.key, &completed) {
            warn!(step = %step, "Failed to persist uncompletion: {err}");
            return Err(err.into());
        }

        session.apply(completed, Some(step), Utc::now());
        debug!(step = %step, active = ?session.active(), "Uncompleted step");
        self.emit_state_changed();
        Ok(())
    }

    /// Point the active step at an available step. Nothing is persisted.
    pub fn set_active(&mut self, step: StepId) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NotLoaded)?;
        if !session.is_available(step) {
            return Err(EngineError::NotAvailable {
                step,
                reason: session.unavailable_reason(step),
            });
        }
        if session.active() == Some(step) {
            return Ok(());
        }
        session.set_active(step);
        self.emit_state_changed();
        Ok(())
    }

    /// Move to the next available step. Returns whether `active` changed.
    pub fn next(&mut self) -> Result<bool, EngineError> {
        self.step_active(true)
    }

    /// Move to the previous available step. Returns whether `active` changed.
    pub fn previous(&mut self) -> Result<bool, EngineError> {
        self.step_active(false)
    }

    fn step_active(&mut self, forward: bool) -> Result<bool, EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NotLoaded)?;
        let Some(target) = session.neighbor(forward) else {
            return Ok(false);
        };
        session.set_active(target);
        self.emit_state_changed();
        Ok(true)
    }

    /// Clear all progress for the loaded procedure, in memory and in storage.
    ///
    /// The graph is not re-fetched.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NotLoaded)?;
        if let Err(err) = self.progress.clear_progress(&session.key) {
            warn!(key = %session.key, "Failed to clear progress: {err}");
            return Err(err.into());
        }

        session.apply(BTreeSet::new(), None, Utc::now());
        debug!(key = %session.key, active = ?session.active(), "Reset progress");
        self.emit_state_changed();
        Ok(())
    }

    /// Append a history entry for the finished session.
    ///
    /// Only valid in the `Completed` phase. Each call logs a new record with
    /// a fresh id.
    pub fn record_completion(
        &mut self,
        equipment_name: &str,
        rating: Option<Rating>,
        notes: Option<NonEmptyString>,
    ) -> Result<CompletionRecord, EngineError> {
        let session = self.session.as_ref().ok_or(EngineError::NotLoaded)?;
        let completed_at = session.finished_at().ok_or(EngineError::NotFinished)?;

        let record = CompletionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            procedure_id: session.key.procedure().clone(),
            equipment_id: session.key.equipment().clone(),
            equipment_name: equipment_name.to_owned(),
            started_at: session.started_at,
            completed_at,
            rating,
            notes,
        };
        self.progress.log_completion(&record)?;
        info!(record = %record.id, key = %session.key, "Logged completion");
        Ok(record)
    }
}

#[cfg(test)]
mod tests;
