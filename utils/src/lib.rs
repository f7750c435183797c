//! Shared infrastructure utilities for Pitstop.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename), used for
//!   installed procedure documents and history exports.

pub mod atomic_write;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options,
    recover_bak_file,
};
