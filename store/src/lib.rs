//! Persistence for Pitstop.
//!
//! Two independent stores live here:
//!
//! - the procedure catalog ([`ProcedureCatalog`], [`ProcedureStore`]), which
//!   resolves equipment ids to validated procedure graphs on disk;
//! - the progress store ([`ProgressStore`], [`SqliteProgressStore`]), which
//!   durably records completed steps, completion history and preferences.

mod catalog;
mod history;
mod memory;
mod progress;
mod sqlite;
mod sqlite_security;

pub use catalog::{
    CatalogError, DocumentFormat, InMemoryCatalog, ProcedureCatalog, ProcedureStore,
    StorageLocation, read_document, read_procedure,
};
pub use history::{HISTORY_FORMAT_VERSION, export_history, import_history_file};
pub use memory::MemoryProgressStore;
pub use progress::{PreferenceValue, ProgressStore, StorageError};
pub use sqlite::SqliteProgressStore;
