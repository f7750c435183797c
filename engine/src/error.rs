use std::fmt;
use std::path::PathBuf;

use pitstop_store::{CatalogError, StorageError};
use pitstop_types::{EquipmentId, ProcedureId, ProcedureValidationError, StepId};
use thiserror::Error;

/// Why a step cannot be completed or activated right now.
///
/// Diagnostic detail only: callers should treat every reason the same way
/// and consult the available set instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotAvailableReason {
    AlreadyCompleted,
    Blocked { missing: Vec<StepId> },
    UnknownStep,
}

impl fmt::Display for NotAvailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCompleted => f.write_str("already completed"),
            Self::Blocked { missing } => write!(f, "blocked by {}", join_steps(missing)),
            Self::UnknownStep => f.write_str("no such step in this procedure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no procedure is loaded")]
    NotLoaded,
    #[error("procedure {procedure} not found for equipment {equipment}")]
    NotFound {
        equipment: EquipmentId,
        procedure: ProcedureId,
    },
    #[error("malformed procedure document {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("procedure {procedure} is invalid: {source}")]
    InvariantViolation {
        procedure: ProcedureId,
        #[source]
        source: ProcedureValidationError,
    },
    #[error("step {step} is not available: {reason}")]
    NotAvailable {
        step: StepId,
        reason: NotAvailableReason,
    },
    #[error("step {step} is not completed")]
    NotCompleted { step: StepId },
    #[error("step {step} is required by completed steps {}", join_steps(.dependents))]
    DependentsExist {
        step: StepId,
        dependents: Vec<StepId>,
    },
    #[error("procedure is not finished yet")]
    NotFinished,
    #[error("procedure catalog unavailable: {0}")]
    Catalog(#[source] CatalogError),
    #[error("progress storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<CatalogError> for EngineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound {
                equipment,
                procedure,
            } => Self::NotFound {
                equipment,
                procedure,
            },
            CatalogError::Parse { path, message } => Self::Parse { path, message },
            CatalogError::Invalid { procedure, source } => {
                Self::InvariantViolation { procedure, source }
            }
            other @ (CatalogError::Io { .. } | CatalogError::NoWritableLocation) => {
                Self::Catalog(other)
            }
        }
    }
}

fn join_steps(steps: &[StepId]) -> String {
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
