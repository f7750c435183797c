//! Completion history export and import.
//!
//! The file format is a versioned JSON envelope:
//!
//! ```json
//! { "version": 1, "records": [ { "id": "...", ... } ] }
//! ```
//!
//! Import merges by record id, so importing the same file twice is a no-op.

use std::fs;
use std::path::Path;

use pitstop_types::CompletionRecord;
use pitstop_utils::{AtomicWriteOptions, PersistMode, atomic_write_with_options, recover_bak_file};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::progress::{ProgressStore, StorageError};

pub const HISTORY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    records: Vec<CompletionRecord>,
}

/// Write the full completion history to `path`. Returns the record count.
///
/// The file is owner-only, like the progress database it is exported from.
pub fn export_history(store: &dyn ProgressStore, path: &Path) -> Result<usize, StorageError> {
    let file = HistoryFile {
        version: HISTORY_FORMAT_VERSION,
        records: store.completion_history()?,
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let options = AtomicWriteOptions {
        mode: PersistMode::OwnerOnly,
        ..AtomicWriteOptions::default()
    };
    atomic_write_with_options(path, &json, options).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(path = %path.display(), records = file.records.len(), "Exported completion history");
    Ok(file.records.len())
}

/// Merge the history stored at `path` into `store`. Returns how many new
/// records were added.
pub fn import_history_file(store: &dyn ProgressStore, path: &Path) -> Result<usize, StorageError> {
    recover_bak_file(path);
    let bytes = fs::read(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: HistoryFile = serde_json::from_slice(&bytes)?;
    if file.version != HISTORY_FORMAT_VERSION {
        return Err(StorageError::Corrupt {
            key: path.display().to_string(),
            detail: format!("unsupported history version {}", file.version),
        });
    }

    let added = store.import_history(&file.records)?;
    info!(
        path = %path.display(),
        offered = file.records.len(),
        added,
        "Imported completion history"
    );
    Ok(added)
}
