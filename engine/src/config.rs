//! `~/.pitstop/config.toml` loading and storage path resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

use pitstop_store::{ProcedureStore, SqliteProgressStore, StorageError, StorageLocation};
use serde::Deserialize;
use thiserror::Error;

use crate::DependencyEngine;

/// Overrides the base directory (normally `~/.pitstop`).
pub const HOME_ENV: &str = "PITSTOP_HOME";

const BASE_DIR_NAME: &str = ".pitstop";

#[derive(Debug, Default, Deserialize)]
pub struct PitstopConfig {
    pub storage: Option<StorageConfig>,
}

/// `[storage]` section. Values may use `${VAR}` references and a leading `~`.
#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    pub user_procedures: Option<String>,
    pub bundled_procedures: Option<String>,
    pub progress_db: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Fully resolved storage locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub user_procedures: PathBuf,
    pub bundled_procedures: Option<PathBuf>,
    pub progress_db: PathBuf,
}

impl StoragePaths {
    #[must_use]
    pub fn procedure_store(&self) -> ProcedureStore {
        let mut locations = vec![StorageLocation::user(&self.user_procedures)];
        if let Some(bundled) = &self.bundled_procedures {
            locations.push(StorageLocation::bundled(bundled));
        }
        ProcedureStore::new(locations)
    }

    pub fn open_progress_store(&self) -> Result<SqliteProgressStore, StorageError> {
        SqliteProgressStore::open(&self.progress_db)
    }

    /// Engine wired to the filesystem catalog and the SQLite progress store.
    pub fn open_engine(&self) -> Result<DependencyEngine, StorageError> {
        Ok(DependencyEngine::new(
            Arc::new(self.procedure_store()),
            Arc::new(self.open_progress_store()?),
        ))
    }
}

/// Expand `${VAR}` references. Unset variables expand to nothing; an
/// unterminated `${` is kept verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Expand env references, then a leading `~` against the home directory.
#[must_use]
pub fn expand_path(value: &str) -> PathBuf {
    let expanded = expand_env_vars(value);
    if expanded == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = expanded.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(expanded)
}

/// `$PITSTOP_HOME`, else `~/.pitstop`.
#[must_use]
pub fn base_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var(HOME_ENV)
        && !home.trim().is_empty()
    {
        return Some(expand_path(&home));
    }
    dirs::home_dir().map(|home| home.join(BASE_DIR_NAME))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    base_dir().map(|base| base.join("config.toml"))
}

impl PitstopConfig {
    /// Load the config file. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!(path = %path.display(), "Failed to read config: {source}");
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        toml::from_str(&content).map(Some).map_err(|source| {
            tracing::warn!(path = %path.display(), "Failed to parse config: {source}");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Resolve storage paths against the base directory, falling back to
    /// `./.pitstop` when no home directory can be found.
    #[must_use]
    pub fn storage_paths(&self) -> StoragePaths {
        let base = base_dir().unwrap_or_else(|| PathBuf::from(BASE_DIR_NAME));
        self.storage_paths_in(&base)
    }

    fn storage_paths_in(&self, base: &Path) -> StoragePaths {
        let storage = self.storage.as_ref();
        let pick = |value: Option<&String>, default: &str| {
            value.map_or_else(|| base.join(default), |v| expand_path(v))
        };
        StoragePaths {
            user_procedures: pick(
                storage.and_then(|s| s.user_procedures.as_ref()),
                "procedures",
            ),
            bundled_procedures: storage
                .and_then(|s| s.bundled_procedures.as_deref())
                .map(expand_path),
            progress_db: pick(storage.and_then(|s| s.progress_db.as_ref()), "progress.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{ConfigError, PitstopConfig, expand_env_vars, expand_path};

    #[test]
    fn expand_env_vars_replaces_known_and_drops_unknown() {
        unsafe {
            std::env::set_var("PITSTOP_TEST_SHOP", "garage");
            std::env::remove_var("PITSTOP_TEST_MISSING");
        }
        assert_eq!(
            expand_env_vars("/srv/${PITSTOP_TEST_SHOP}/${PITSTOP_TEST_MISSING}db"),
            "/srv/garage/db"
        );
        unsafe {
            std::env::remove_var("PITSTOP_TEST_SHOP");
        }
    }

    #[test]
    fn expand_env_vars_keeps_unclosed_reference() {
        assert_eq!(expand_env_vars("a ${UNCLOSED"), "a ${UNCLOSED");
        assert_eq!(expand_env_vars("x${}y"), "xy");
    }

    #[test]
    fn expand_path_handles_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_path("~/procs"), home.join("procs"));
        assert_eq!(expand_path("~"), home);
        assert_eq!(expand_path("/abs/~/x"), PathBuf::from("/abs/~/x"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = PitstopConfig::load_from(&dir.path().join("config.toml")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage\nuser_procedures = 1").expect("write");

        let err = PitstopConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn storage_paths_default_under_base() {
        let config = PitstopConfig::default();
        let paths = config.storage_paths_in(Path::new("/data/pitstop"));
        assert_eq!(paths.user_procedures, PathBuf::from("/data/pitstop/procedures"));
        assert_eq!(paths.progress_db, PathBuf::from("/data/pitstop/progress.db"));
        assert!(paths.bundled_procedures.is_none());
    }

    #[test]
    fn storage_paths_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
bundled_procedures = "/usr/share/pitstop/procedures"
progress_db = "/var/lib/pitstop/progress.db"
"#,
        )
        .expect("write");

        let config = PitstopConfig::load_from(&path)
            .expect("load")
            .expect("config present");
        let paths = config.storage_paths_in(Path::new("/base"));
        assert_eq!(paths.user_procedures, PathBuf::from("/base/procedures"));
        assert_eq!(
            paths.bundled_procedures,
            Some(PathBuf::from("/usr/share/pitstop/procedures"))
        );
        assert_eq!(paths.progress_db, PathBuf::from("/var/lib/pitstop/progress.db"));
    }
}
