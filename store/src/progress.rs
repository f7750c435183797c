//! Progress Store contract.
//!
//! The store is the single source of truth for completed steps across
//! restarts. Every write must be durable (or have failed) before the call
//! returns; implementations serialize writes internally so that distinct
//! engine sessions can share one store.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use pitstop_types::{CompletionRecord, ProgressKey, ProgressRecord, StepId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed stored data: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt value stored under {key}: {detail}")]
    Corrupt { key: String, detail: String },
    #[error("completion record {0} is already logged")]
    DuplicateRecord(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Scalar preference value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceValue {
    Text(String),
    Bool(bool),
    Int(i64),
}

impl PreferenceValue {
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
        }
    }
}

pub trait ProgressStore: Send + Sync {
    /// Stored record for `key`, or `None` if nothing was ever completed.
    fn progress_record(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StorageError>;

    /// Replace the completed set for `key` and stamp `last_updated`.
    fn set_completed_steps(
        &self,
        key: &ProgressKey,
        steps: &BTreeSet<StepId>,
    ) -> Result<ProgressRecord, StorageError>;

    /// Remove the record for `key`. Clearing a missing record is not an error.
    fn clear_progress(&self, key: &ProgressKey) -> Result<(), StorageError>;

    /// Append a history entry. Fails with [`StorageError::DuplicateRecord`]
    /// if an entry with the same id exists.
    fn log_completion(&self, record: &CompletionRecord) -> Result<(), StorageError>;

    /// All history entries, oldest completion first.
    fn completion_history(&self) -> Result<Vec<CompletionRecord>, StorageError>;

    /// Merge entries by id: unknown ids are appended, known ids are left
    /// untouched. Returns how many entries were added.
    fn import_history(&self, records: &[CompletionRecord]) -> Result<usize, StorageError>;

    fn preference(&self, key: &str) -> Result<Option<PreferenceValue>, StorageError>;

    fn set_preference(&self, key: &str, value: PreferenceValue) -> Result<(), StorageError>;

    /// Completed steps for `key`; empty if no record exists.
    fn completed_steps(&self, key: &ProgressKey) -> Result<BTreeSet<StepId>, StorageError> {
        Ok(self
            .progress_record(key)?
            .map(|record| record.completed_step_ids)
            .unwrap_or_default())
    }

    fn string_pref(&self, key: &str, default: &str) -> Result<String, StorageError> {
        Ok(match self.preference(key)? {
            Some(PreferenceValue::Text(value)) => value,
            _ => default.to_owned(),
        })
    }

    fn bool_pref(&self, key: &str, default: bool) -> Result<bool, StorageError> {
        Ok(match self.preference(key)? {
            Some(PreferenceValue::Bool(value)) => value,
            _ => default,
        })
    }

    fn int_pref(&self, key: &str, default: i64) -> Result<i64, StorageError> {
        Ok(match self.preference(key)? {
            Some(PreferenceValue::Int(value)) => value,
            _ => default,
        })
    }

    fn set_string_pref(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_preference(key, PreferenceValue::Text(value.to_owned()))
    }

    fn set_bool_pref(&self, key: &str, value: bool) -> Result<(), StorageError> {
        self.set_preference(key, PreferenceValue::Bool(value))
    }

    fn set_int_pref(&self, key: &str, value: i64) -> Result<(), StorageError> {
        self.set_preference(key, PreferenceValue::Int(value))
    }
}
