//! SQLite-backed progress store.
//!
//! Three tables: `progress` (one row per equipment/procedure key),
//! `completion_history` (append-only), and `preferences`. The connection is
//! guarded by a mutex, so writes to any key are serialized, and every write
//! runs in its own transaction with `synchronous=FULL`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use pitstop_types::{
    CompletionRecord, EquipmentId, NonEmptyString, ProcedureId, ProgressKey, ProgressRecord,
    Rating, StepId,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::progress::{PreferenceValue, ProgressStore, StorageError};
use crate::sqlite_security::prepare_db_path;

pub struct SqliteProgressStore {
    db: Mutex<Connection>,
}

impl SqliteProgressStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS progress (
            key TEXT PRIMARY KEY,
            equipment_id TEXT NOT NULL,
            procedure_id TEXT NOT NULL,
            completed_step_ids TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS completion_history (
            id TEXT PRIMARY KEY,
            procedure_id TEXT NOT NULL,
            equipment_id TEXT NOT NULL,
            equipment_name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            rating INTEGER,
            notes TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_completion_history_completed
        ON completion_history(completed_at);

        CREATE TABLE IF NOT EXISTS preferences (
            key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            value TEXT NOT NULL
        );
    ";

    /// Open or create the progress database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        prepare_db_path(path)?;

        let db = Connection::open(path)?;
        debug!(path = %path.display(), "Opened progress database");
        Self::initialize(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(db: Connection) -> Result<Self, StorageError> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        db.execute_batch(Self::SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Column codecs ────────────────────────────────────────────

/// Fixed-width nanosecond timestamps: lossless and lexically sortable.
fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(key: &str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            key: key.to_owned(),
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn corrupt(key: &str, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt {
        key: key.to_owned(),
        detail: detail.to_string(),
    }
}

struct HistoryRow {
    id: String,
    procedure_id: String,
    equipment_id: String,
    equipment_name: String,
    started_at: String,
    completed_at: String,
    rating: Option<i64>,
    notes: Option<String>,
}

impl HistoryRow {
    const COLUMNS: &'static str = "id, procedure_id, equipment_id, equipment_name, \
                                   started_at, completed_at, rating, notes";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            procedure_id: row.get(1)?,
            equipment_id: row.get(2)?,
            equipment_name: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            rating: row.get(6)?,
            notes: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<CompletionRecord, StorageError> {
        let key = self.id.clone();
        let rating = self
            .rating
            .map(|value| {
                u8::try_from(value)
                    .map_err(|e| corrupt(&key, e))
                    .and_then(|v| Rating::new(v).map_err(|e| corrupt(&key, e)))
            })
            .transpose()?;
        Ok(CompletionRecord {
            procedure_id: ProcedureId::new(self.procedure_id).map_err(|e| corrupt(&key, e))?,
            equipment_id: EquipmentId::new(self.equipment_id).map_err(|e| corrupt(&key, e))?,
            equipment_name: self.equipment_name,
            started_at: decode_time(&key, &self.started_at)?,
            completed_at: decode_time(&key, &self.completed_at)?,
            rating,
            notes: self.notes.and_then(|n| NonEmptyString::new(n).ok()),
            id: self.id,
        })
    }
}

fn insert_history(
    db: &Connection,
    record: &CompletionRecord,
    or_ignore: bool,
) -> Result<usize, StorageError> {
    let verb = if or_ignore {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let sql = format!(
        "{verb} INTO completion_history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        HistoryRow::COLUMNS
    );
    let changed = db.execute(
        &sql,
        params![
            record.id,
            record.procedure_id.as_str(),
            record.equipment_id.as_str(),
            record.equipment_name,
            encode_time(record.started_at),
            encode_time(record.completed_at),
            record.rating.map(|r| i64::from(r.value())),
            record.notes.as_ref().map(NonEmptyString::as_str),
        ],
    )?;
    Ok(changed)
}

impl ProgressStore for SqliteProgressStore {
    fn progress_record(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StorageError> {
        let storage_key = key.storage_key();
        let row: Option<(String, String)> = self
            .lock()
            .query_row(
                "SELECT completed_step_ids, last_updated FROM progress WHERE key = ?1",
                [&storage_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((ids_json, last_updated)) = row else {
            return Ok(None);
        };
        let completed_step_ids: BTreeSet<StepId> =
            serde_json::from_str(&ids_json).map_err(|e| corrupt(&storage_key, e))?;
        Ok(Some(ProgressRecord {
            completed_step_ids,
            last_updated: decode_time(&storage_key, &last_updated)?,
        }))
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
        let ids_json = serde_json::to_string(&record.completed_step_ids)?;

        let mut db = self.lock();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO progress (key, equipment_id, procedure_id, completed_step_ids, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                completed_step_ids = excluded.completed_step_ids,
                last_updated = excluded.last_updated",
            params![
                key.storage_key(),
                key.equipment().as_str(),
                key.procedure().as_str(),
                ids_json,
                encode_time(record.last_updated),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn clear_progress(&self, key: &ProgressKey) -> Result<(), StorageError> {
        self.lock()
            .execute("DELETE FROM progress WHERE key = ?1", [key.storage_key()])?;
        Ok(())
    }

    fn log_completion(&self, record: &CompletionRecord) -> Result<(), StorageError> {
        let mut db = self.lock();
        let tx = db.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM completion_history WHERE id = ?1",
                [&record.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StorageError::DuplicateRecord(record.id.clone()));
        }
        insert_history(&tx, record, false)?;
        tx.commit()?;
        Ok(())
    }

    fn completion_history(&self) -> Result<Vec<CompletionRecord>, StorageError> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM completion_history ORDER BY completed_at ASC, id ASC",
            HistoryRow::COLUMNS
        ))?;
        let rows = stmt.query_map([], HistoryRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn import_history(&self, records: &[CompletionRecord]) -> Result<usize, StorageError> {
        let mut db = self.lock();
        let tx = db.transaction()?;
        let mut added = 0;
        for record in records {
            added += insert_history(&tx, record, true)?;
        }
        tx.commit()?;
        Ok(added)
    }

    fn preference(&self, key: &str) -> Result<Option<PreferenceValue>, StorageError> {
        let row: Option<(String, String)> = self
            .lock()
            .query_row(
                "SELECT kind, value FROM preferences WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((kind, value)) = row else {
            return Ok(None);
        };
        let parsed = match kind.as_str() {
            "text" => PreferenceValue::Text(value),
            "bool" => PreferenceValue::Bool(value == "true"),
            "int" => PreferenceValue::Int(value.parse().map_err(|e| corrupt(key, e))?),
            other => return Err(corrupt(key, format!("unknown preference kind {other:?}"))),
        };
        Ok(Some(parsed))
    }

    fn set_preference(&self, key: &str, value: PreferenceValue) -> Result<(), StorageError> {
        let encoded = match &value {
            PreferenceValue::Text(text) => text.clone(),
            PreferenceValue::Bool(flag) => flag.to_string(),
            PreferenceValue::Int(number) => number.to_string(),
        };
        self.lock().execute(
            "INSERT INTO preferences (key, kind, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET kind = excluded.kind, value = excluded.value",
            params![key, value.kind(), encoded],
        )?;
        Ok(())
    }
}
