use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Step identifiers ─────────────────────────────────────────

/// Identifier of a step within one procedure.
///
/// Zero is structurally unrepresentable via `NonZeroU32`, so deserializing
/// `0` fails before any graph validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(NonZeroU32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("step id must be a positive 32-bit integer")]
pub struct StepIdError;

impl StepId {
    pub fn try_new(value: u32) -> Result<Self, StepIdError> {
        NonZeroU32::new(value).map(Self).ok_or(StepIdError)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for StepId {
    type Error = StepIdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl TryFrom<i64> for StepId {
    type Error = StepIdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let narrowed = u32::try_from(value).map_err(|_err| StepIdError)?;
        Self::try_new(narrowed)
    }
}

impl std::str::FromStr for StepId {
    type Err = StepIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s.trim().parse().map_err(|_err| StepIdError)?;
        Self::try_new(value)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ── Equipment / procedure identifiers ────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier {0:?} must not start with '.'")]
    LeadingDot(String),
    #[error("identifier {value:?} contains invalid character {ch:?}")]
    InvalidCharacter { value: String, ch: char },
}

/// Identifiers double as path components in the procedure store layout
/// (`<root>/<equipment>/<procedure>.json`), so only `[A-Za-z0-9._-]` is
/// accepted and a leading dot is rejected.
fn validate_identifier(value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if value.starts_with('.') {
        return Err(IdentifierError::LeadingDot(value.to_owned()));
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdentifierError::InvalidCharacter {
            value: value.to_owned(),
            ch,
        });
    }
    Ok(())
}

/// Identifier of an equipment type (e.g. an engine model).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EquipmentId(String);

impl EquipmentId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
        let value = value.into();
        validate_identifier(&value)?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EquipmentId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EquipmentId> for String {
    fn from(value: EquipmentId) -> Self {
        value.0
    }
}

impl fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a procedure, unique per equipment id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcedureId(String);

impl ProcedureId {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
        let value = value.into();
        validate_identifier(&value)?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProcedureId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProcedureId> for String {
    fn from(value: ProcedureId) -> Self {
        value.0
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Progress key ─────────────────────────────────────────────

/// Composite key of a progress record: one per (equipment, procedure) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgressKey {
    equipment: EquipmentId,
    procedure: ProcedureId,
}

impl ProgressKey {
    /// Separator of the persisted composite key. Cannot appear inside a
    /// validated identifier.
    pub const SEPARATOR: &'static str = "::";

    #[must_use]
    pub fn new(equipment: EquipmentId, procedure: ProcedureId) -> Self {
        Self {
            equipment,
            procedure,
        }
    }

    #[must_use]
    pub fn equipment(&self) -> &EquipmentId {
        &self.equipment
    }

    #[must_use]
    pub fn procedure(&self) -> &ProcedureId {
        &self.procedure
    }

    /// Composite string form used as the persisted key.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.equipment, Self::SEPARATOR, self.procedure)
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.equipment, self.procedure)
    }
}
