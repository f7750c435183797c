//! Volatile progress store for tests and throwaway sessions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use pitstop_types::{CompletionRecord, ProgressKey, ProgressRecord, StepId};

use crate::progress::{PreferenceValue, ProgressStore, StorageError};

#[derive(Debug, Default)]
struct MemoryState {
    progress: HashMap<ProgressKey, ProgressRecord>,
    history: Vec<CompletionRecord>,
    preferences: HashMap<String, PreferenceValue>,
}

/// [`ProgressStore`] held entirely in memory behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    state: Mutex<MemoryState>,
}

impl MemoryProgressStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressStore for MemoryProgressStore {
    fn progress_record(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StorageError> {
        Ok(self.lock().progress.get(key).cloned())
    }

    fn set_completed_steps(
        &self,
        key: &ProgressKey,
        steps: &BTreeSet<StepId>,
    ) -> Result<ProgressRecord, StorageError> {
        let record = ProgressRecord {
            completed_step_ids: steps.clone(),
            last_updated: Utc::now(),
        };
        self.lock().progress.insert(key.clone(), record.clone());
        Ok(record)
    }

    fn clear_progress(&self, key: &ProgressKey) -> Result<(), StorageError> {
        self.lock().progress.remove(key);
        Ok(())
    }

    fn log_completion(&self, record: &CompletionRecord) -> Result<(), StorageError> {
        let mut state = self.lock();
        if state.history.iter().any(|r| r.id == record.id) {
            return Err(StorageError::DuplicateRecord(record.id.clone()));
        }
        state.history.push(record.clone());
        Ok(())
    }

    fn completion_history(&self) -> Result<Vec<CompletionRecord>, StorageError> {
        let mut history = self.lock().history.clone();
        history.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(history)
    }

    fn import_history(&self, records: &[CompletionRecord]) -> Result<usize, StorageError> {
        let mut state = self.lock();
        let mut added = 0;
        for record in records {
            if state.history.iter().any(|r| r.id == record.id) {
                continue;
            }
            state.history.push(record.clone());
            added += 1;
        }
        Ok(added)
    }

    fn preference(&self, key: &str) -> Result<Option<PreferenceValue>, StorageError> {
        Ok(self.lock().preferences.get(key).cloned())
    }

    fn set_preference(&self, key: &str, value: PreferenceValue) -> Result<(), StorageError> {
        self.lock().preferences.insert(key.to_owned(), value);
        Ok(())
    }
}
