//! Procedure data model: a DAG of repair steps.
//!
//! Pure domain types with no IO and no async. Invariants are enforced at
//! construction time: a [`Procedure`] that exists has unique step ids, only
//! known requirements, no requirement cycles, and at least one entry step.

use std::collections::{BTreeSet, HashMap, btree_set};
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::{EquipmentId, ProcedureId, StepId};

// ── Step ─────────────────────────────────────────────────────

/// One node of a procedure graph.
///
/// Only `id` and `requires` carry meaning for dependency resolution; every
/// other field is display payload passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    id: StepId,
    action: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    requires: BTreeSet<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    part_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    torque: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    media: Vec<String>,
}

impl Step {
    #[must_use]
    pub fn new(id: StepId, action: impl Into<String>) -> Self {
        Self {
            id,
            action: action.into(),
            details: String::new(),
            requires: BTreeSet::new(),
            part_ref: None,
            tools: Vec::new(),
            warnings: Vec::new(),
            torque: None,
            media: Vec::new(),
        }
    }

    pub fn with_requires(mut self, requires: impl IntoIterator<Item = StepId>) -> Self {
        self.requires = requires.into_iter().collect();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_part_ref(mut self, part_ref: impl Into<String>) -> Self {
        self.part_ref = Some(part_ref.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    #[must_use]
    pub fn requires(&self) -> &BTreeSet<StepId> {
        &self.requires
    }

    #[must_use]
    pub fn part_ref(&self) -> Option<&str> {
        self.part_ref.as_deref()
    }

    #[must_use]
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    #[must_use]
    pub fn torque(&self) -> Option<&Value> {
        self.torque.as_ref()
    }

    #[must_use]
    pub fn media(&self) -> &[String] {
        &self.media
    }

    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.requires.is_empty()
    }
}

// ── Validation errors ────────────────────────────────────────

/// Requirement cycle, listed in `requires` direction: `[1, 2, 1]` means
/// step 1 requires 2 which requires 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(Vec<StepId>);

impl CyclePath {
    #[must_use]
    pub fn steps(&self) -> &[StepId] {
        &self.0
    }
}

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                f.write_str(" -> ")?;
            }
            write!(f, "{id}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureValidationError {
    #[error("duplicate step id {id}")]
    DuplicateStepId { id: StepId },
    #[error("step {step_id} requires unknown step {requirement}")]
    UnknownRequirement {
        step_id: StepId,
        requirement: StepId,
    },
    #[error("requirement cycle: {path}")]
    Cycle { path: CyclePath },
    #[error("procedure has no entry step (every step has requirements)")]
    NoEntryStep,
}

impl ProcedureValidationError {
    /// Step ids named by this violation, for diagnostics.
    #[must_use]
    pub fn offending_steps(&self) -> Vec<StepId> {
        match self {
            Self::DuplicateStepId { id } => vec![*id],
            Self::UnknownRequirement {
                step_id,
                requirement,
            } => vec![*step_id, *requirement],
            Self::Cycle { path } => {
                let mut ids: Vec<StepId> = path.steps().to_vec();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            Self::NoEntryStep => Vec::new(),
        }
    }
}

// ── Document (wire form) ─────────────────────────────────────

/// Unvalidated procedure as stored on disk.
///
/// Parsing a document only checks field shapes; graph invariants are
/// checked by [`Procedure::from_document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureDocument {
    pub id: ProcedureId,
    pub name: String,
    pub equipment_id: EquipmentId,
    #[serde(default)]
    pub steps: Vec<Step>,
}

// ── Summary ──────────────────────────────────────────────────

/// Which storage location a procedure was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureOrigin {
    /// User-writable storage. Overrides bundled procedures with the same id.
    User,
    /// Read-only storage shipped with the application.
    Bundled,
}

impl ProcedureOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bundled => "bundled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureSummary {
    pub id: ProcedureId,
    pub name: String,
    pub equipment_id: EquipmentId,
    pub step_count: usize,
    pub origin: ProcedureOrigin,
}

// ── Procedure ────────────────────────────────────────────────

/// Validated, immutable procedure graph.
///
/// Step order is the stable display order; the position of a step in
/// [`Procedure::steps`] is its ordering index for "lowest available" and
/// next/previous navigation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    id: ProcedureId,
    name: String,
    equipment_id: EquipmentId,
    steps: Vec<Step>,
    #[serde(skip)]
    positions: HashMap<StepId, usize>,
}

impl<'de> Deserialize<'de> for Procedure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let document = ProcedureDocument::deserialize(deserializer)?;
        Procedure::from_document(document).map_err(D::Error::custom)
    }
}

impl Procedure {
    pub fn new(
        id: ProcedureId,
        name: impl Into<String>,
        equipment_id: EquipmentId,
        steps: Vec<Step>,
    ) -> Result<Self, ProcedureValidationError> {
        let positions = validate(&steps)?;
        Ok(Self {
            id,
            name: name.into(),
            equipment_id,
            steps,
            positions,
        })
    }

    pub fn from_document(document: ProcedureDocument) -> Result<Self, ProcedureValidationError> {
        Self::new(
            document.id,
            document.name,
            document.equipment_id,
            document.steps,
        )
    }

    #[must_use]
    pub fn to_document(&self) -> ProcedureDocument {
        ProcedureDocument {
            id: self.id.clone(),
            name: self.name.clone(),
            equipment_id: self.equipment_id.clone(),
            steps: self.steps.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ProcedureId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn equipment_id(&self) -> &EquipmentId {
        &self.equipment_id
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.positions.get(&id).map(|&idx| &self.steps[idx])
    }

    #[must_use]
    pub fn contains(&self, id: StepId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.steps.iter().map(Step::id)
    }

    #[must_use]
    pub fn entry_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.is_entry())
            .map(Step::id)
            .collect()
    }

    /// Steps not in `completed` whose requirements are all in `completed`,
    /// in stable order.
    #[must_use]
    pub fn available_steps(&self, completed: &BTreeSet<StepId>) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .filter(|s| s.requires.iter().all(|r| completed.contains(r)))
            .map(Step::id)
            .collect()
    }

    /// Requirements of `id` that are not yet in `completed`.
    #[must_use]
    pub fn missing_requirements(&self, id: StepId, completed: &BTreeSet<StepId>) -> Vec<StepId> {
        self.step(id)
            .map(|s| {
                s.requires
                    .iter()
                    .filter(|r| !completed.contains(r))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members of `completed` that directly require `id`.
    #[must_use]
    pub fn completed_dependents(&self, id: StepId, completed: &BTreeSet<StepId>) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| completed.contains(&s.id) && s.requires.contains(&id))
            .map(Step::id)
            .collect()
    }

    /// Every step id of the procedure is a member of `completed`.
    ///
    /// Checked per id, never by comparing counts: step ids may be sparse, and
    /// a count comparison would also accept a set holding stale foreign ids.
    #[must_use]
    pub fn is_fully_completed(&self, completed: &BTreeSet<StepId>) -> bool {
        self.steps.iter().all(|s| completed.contains(&s.id))
    }

    #[must_use]
    pub fn summary(&self, origin: ProcedureOrigin) -> ProcedureSummary {
        ProcedureSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            equipment_id: self.equipment_id.clone(),
            step_count: self.steps.len(),
            origin,
        }
    }
}

/// Check all graph invariants, returning the id → position index.
fn validate(steps: &[Step]) -> Result<HashMap<StepId, usize>, ProcedureValidationError> {
    let mut positions = HashMap::with_capacity(steps.len());
    for (idx, step) in steps.iter().enumerate() {
        if positions.insert(step.id, idx).is_some() {
            return Err(ProcedureValidationError::DuplicateStepId { id: step.id });
        }
    }

    for step in steps {
        if let Some(requirement) = step.requires.iter().find(|r| !positions.contains_key(r)) {
            return Err(ProcedureValidationError::UnknownRequirement {
                step_id: step.id,
                requirement: *requirement,
            });
        }
    }

    if let Some(path) = find_cycle(steps, &positions) {
        return Err(ProcedureValidationError::Cycle { path });
    }

    if !steps.iter().any(Step::is_entry) {
        return Err(ProcedureValidationError::NoEntryStep);
    }

    Ok(positions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over `requires` edges with three-color marking.
/// A back edge onto the current path closes a cycle.
///
/// The walk keeps its own work stack so that long requirement chains cannot
/// exhaust the thread stack. Each frame is a step on the current path plus
/// the requirements it has yet to visit.
fn find_cycle(steps: &[Step], positions: &HashMap<StepId, usize>) -> Option<CyclePath> {
    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut path: Vec<(usize, btree_set::Iter<'_, StepId>)> = Vec::new();

    for start in 0..steps.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnStack;
        path.push((start, steps[start].requires.iter()));

        while let Some((idx, pending)) = path.last_mut() {
            let idx = *idx;
            let Some(requirement) = pending.next() else {
                marks[idx] = Mark::Done;
                path.pop();
                continue;
            };
            let Some(&next) = positions.get(requirement) else {
                continue;
            };
            match marks[next] {
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    path.push((next, steps[next].requires.iter()));
                }
                Mark::OnStack => {
                    let from = path.iter().position(|(i, _)| *i == next).unwrap_or(0);
                    let mut cycle: Vec<StepId> =
                        path[from..].iter().map(|(i, _)| steps[*i].id).collect();
                    cycle.push(*requirement);
                    return Some(CyclePath(cycle));
                }
                Mark::Done => {}
            }
        }
    }
    None
}
