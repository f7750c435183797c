//! Session state machine types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use pitstop_types::{EquipmentId, Procedure, ProcedureId, ProgressKey, StepId};
use serde::Serialize;
use tracing::error;

use crate::error::NotAvailableReason;

/// Observable phase of the engine.
///
/// `Loaded` and `Stepping` exist only inside a single `load`/`complete` call
/// and are never visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePhase {
    Unloaded,
    Active,
    Completed,
}

/// Working copy of one (equipment, procedure) session.
///
/// `available` is always derived from `procedure` and `completed`, and
/// `active` is always a member of `available`.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) key: ProgressKey,
    pub(crate) procedure: Procedure,
    completed: BTreeSet<StepId>,
    available: Vec<StepId>,
    active: Option<StepId>,
    pub(crate) started_at: DateTime<Utc>,
    /// Set while the session is in the `Completed` phase.
    finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn new(
        key: ProgressKey,
        procedure: Procedure,
        completed: BTreeSet<StepId>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut session = Self {
            key,
            procedure,
            completed: BTreeSet::new(),
            available: Vec::new(),
            active: None,
            started_at: now,
            finished_at: None,
        };
        session.apply(completed, None, now);
        session
    }

    pub(crate) fn phase(&self) -> EnginePhase {
        if self.finished_at.is_some() {
            EnginePhase::Completed
        } else {
            EnginePhase::Active
        }
    }

    pub(crate) fn completed(&self) -> &BTreeSet<StepId> {
        &self.completed
    }

    pub(crate) fn available(&self) -> &[StepId] {
        &self.available
    }

    pub(crate) fn active(&self) -> Option<StepId> {
        self.active
    }

    pub(crate) fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub(crate) fn is_available(&self, step: StepId) -> bool {
        self.available.contains(&step)
    }

    pub(crate) fn unavailable_reason(&self, step: StepId) -> NotAvailableReason {
        if !self.procedure.contains(step) {
            NotAvailableReason::UnknownStep
        } else if self.completed.contains(&step) {
            NotAvailableReason::AlreadyCompleted
        } else {
            NotAvailableReason::Blocked {
                missing: self.procedure.missing_requirements(step, &self.completed),
            }
        }
    }

    /// Replace the completed set and re-derive everything else.
    ///
    /// `preferred_active` wins over the lowest available step when it is
    /// itself available. Returns `true` when this call moved the session
    /// into the `Completed` phase.
    pub(crate) fn apply(
        &mut self,
        completed: BTreeSet<StepId>,
        preferred_active: Option<StepId>,
        now: DateTime<Utc>,
    ) -> bool {
        let was_finished = self.finished_at.is_some();
        self.available = self.procedure.available_steps(&completed);
        self.completed = completed;

        if self.procedure.is_fully_completed(&self.completed) {
            self.active = None;
            if !was_finished {
                self.finished_at = Some(now);
            }
            return !was_finished;
        }

        self.finished_at = None;
        self.active = preferred_active
            .filter(|step| self.available.contains(step))
            .or_else(|| self.available.first().copied());
        if self.active.is_none() {
            error!(
                equipment = %self.key.equipment(),
                procedure = %self.key.procedure(),
                completed = self.completed.len(),
                "No available step in an unfinished procedure"
            );
        }
        false
    }

    /// Point `active` at an available step. Callers check availability.
    pub(crate) fn set_active(&mut self, step: StepId) {
        debug_assert!(self.available.contains(&step));
        self.active = Some(step);
    }

    /// Neighbor of the active step in the available ordering.
    ///
    /// With no active step, `next` yields the first available step and
    /// `previous` yields nothing.
    pub(crate) fn neighbor(&self, forward: bool) -> Option<StepId> {
        let position = self
            .active
            .and_then(|active| self.available.iter().position(|&s| s == active));
        match (position, forward) {
            (Some(idx), true) => self.available.get(idx + 1).copied(),
            (Some(idx), false) => idx.checked_sub(1).and_then(|i| self.available.get(i).copied()),
            (None, true) => self.available.first().copied(),
            (None, false) => None,
        }
    }

    pub(crate) fn snapshot(&self) -> EngineSnapshot {
        let part_ref = |step: StepId| {
            self.procedure
                .step(step)
                .and_then(|s| s.part_ref())
                .map(str::to_owned)
        };
        EngineSnapshot {
            phase: self.phase(),
            equipment_id: Some(self.key.equipment().clone()),
            procedure_id: Some(self.key.procedure().clone()),
            available: self.available.clone(),
            active: self.active,
            completed: self.completed.clone(),
            highlighted_parts: self.available.iter().filter_map(|&s| part_ref(s)).collect(),
            active_part: self.active.and_then(part_ref),
            completed_count: self.completed.len(),
            total_steps: self.procedure.step_count(),
        }
    }
}

/// Point-in-time view of the engine for polling callers and observers.
///
/// The highlighting layer reads `highlighted_parts` (the `partRef` of every
/// available step) and `active_part`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub phase: EnginePhase,
    pub equipment_id: Option<EquipmentId>,
    pub procedure_id: Option<ProcedureId>,
    /// Available steps in stable order.
    pub available: Vec<StepId>,
    pub active: Option<StepId>,
    pub completed: BTreeSet<StepId>,
    pub highlighted_parts: Vec<String>,
    pub active_part: Option<String>,
    pub completed_count: usize,
    pub total_steps: usize,
}

impl EngineSnapshot {
    pub(crate) fn unloaded() -> Self {
        Self {
            phase: EnginePhase::Unloaded,
            equipment_id: None,
            procedure_id: None,
            available: Vec::new(),
            active: None,
            completed: BTreeSet::new(),
            highlighted_parts: Vec::new(),
            active_part: None,
            completed_count: 0,
            total_steps: 0,
        }
    }
}
