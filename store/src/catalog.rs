//! Procedure Store - resolves equipment ids to validated procedure graphs.
//!
//! Procedures live in one or more storage locations laid out as
//! `<root>/<equipment_id>/<procedure_id>.{json,toml}`. User-writable
//! locations take precedence over bundled (read-only) ones: a user document
//! with the same procedure id replaces the bundled one in listings and loads.
//!
//! Listings are cached per equipment id until explicitly invalidated.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use pitstop_types::{
    EquipmentId, Procedure, ProcedureDocument, ProcedureId, ProcedureOrigin, ProcedureSummary,
    ProcedureValidationError,
};
use pitstop_utils::atomic_write;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("procedure {procedure} not found for equipment {equipment}")]
    NotFound {
        equipment: EquipmentId,
        procedure: ProcedureId,
    },
    #[error("failed to parse procedure document {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid procedure {procedure}: {source}")]
    Invalid {
        procedure: ProcedureId,
        #[source]
        source: ProcedureValidationError,
    },
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no user-writable procedure location is configured")]
    NoWritableLocation,
}

/// Source of procedure graphs for the dependency engine.
///
/// [`ProcedureStore`] is the filesystem implementation; [`InMemoryCatalog`]
/// serves fixed procedures for tests and embedding.
pub trait ProcedureCatalog: Send + Sync {
    fn list_procedures(
        &self,
        equipment: &EquipmentId,
    ) -> Result<Vec<ProcedureSummary>, CatalogError>;

    fn load_procedure(
        &self,
        equipment: &EquipmentId,
        procedure: &ProcedureId,
    ) -> Result<Procedure, CatalogError>;
}

// ── Document formats ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Toml,
}

impl DocumentFormat {
    const ALL: [Self; 2] = [Self::Json, Self::Toml];

    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }

    fn parse(self, text: &str) -> Result<ProcedureDocument, String> {
        match self {
            Self::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        }
    }
}

/// Read and parse a procedure document without validating its graph.
pub fn read_document(path: &Path) -> Result<ProcedureDocument, CatalogError> {
    let format = DocumentFormat::from_path(path).ok_or_else(|| CatalogError::Parse {
        path: path.to_path_buf(),
        message: "unsupported extension (expected .json or .toml)".to_owned(),
    })?;
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    format.parse(&text).map_err(|message| CatalogError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Read, parse, and validate a procedure document.
pub fn read_procedure(path: &Path) -> Result<Procedure, CatalogError> {
    let document = read_document(path)?;
    let procedure = document.id.clone();
    Procedure::from_document(document).map_err(|source| CatalogError::Invalid { procedure, source })
}

// ── Filesystem store ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    root: PathBuf,
    origin: ProcedureOrigin,
}

impl StorageLocation {
    pub fn user(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            origin: ProcedureOrigin::User,
        }
    }

    pub fn bundled(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            origin: ProcedureOrigin::Bundled,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn origin(&self) -> ProcedureOrigin {
        self.origin
    }

    fn equipment_dir(&self, equipment: &EquipmentId) -> PathBuf {
        self.root.join(equipment.as_str())
    }

    fn document_path(
        &self,
        equipment: &EquipmentId,
        procedure: &ProcedureId,
        format: DocumentFormat,
    ) -> PathBuf {
        self.equipment_dir(equipment)
            .join(format!("{procedure}.{}", format.extension()))
    }
}

/// Filesystem-backed procedure catalog with a per-equipment listing cache.
#[derive(Debug)]
pub struct ProcedureStore {
    /// User locations first, then bundled; order within a kind is preserved.
    locations: Vec<StorageLocation>,
    cache: Mutex<HashMap<EquipmentId, Vec<ProcedureSummary>>>,
}

impl ProcedureStore {
    #[must_use]
    pub fn new(mut locations: Vec<StorageLocation>) -> Self {
        locations.sort_by_key(|loc| match loc.origin {
            ProcedureOrigin::User => 0,
            ProcedureOrigin::Bundled => 1,
        });
        Self {
            locations,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn locations(&self) -> &[StorageLocation] {
        &self.locations
    }

    /// Drop the cached listing for one equipment id.
    pub fn invalidate_cache(&self, equipment: &EquipmentId) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(equipment);
    }

    /// Validate a procedure document and copy it into the first user location.
    ///
    /// The document is written as JSON to
    /// `<user root>/<equipment>/<procedure>.json`, replacing any earlier
    /// user copy. Invalid documents are rejected before anything is written.
    pub fn install_procedure_file(&self, source: &Path) -> Result<ProcedureSummary, CatalogError> {
        let procedure = read_procedure(source)?;
        self.install(&procedure)
    }

    pub fn install(&self, procedure: &Procedure) -> Result<ProcedureSummary, CatalogError> {
        let location = self
            .locations
            .iter()
            .find(|loc| loc.origin == ProcedureOrigin::User)
            .ok_or(CatalogError::NoWritableLocation)?;

        let dir = location.equipment_dir(procedure.equipment_id());
        fs::create_dir_all(&dir).map_err(|source| CatalogError::Io {
            path: dir.clone(),
            source,
        })?;

        let bytes = serde_json::to_vec_pretty(&procedure.to_document()).map_err(|e| {
            CatalogError::Parse {
                path: dir.clone(),
                message: e.to_string(),
            }
        })?;
        let target = location.document_path(
            procedure.equipment_id(),
            procedure.id(),
            DocumentFormat::Json,
        );
        atomic_write(&target, &bytes).map_err(|source| CatalogError::Io {
            path: target.clone(),
            source,
        })?;

        // A stale TOML copy would shadow nothing but confuse later edits.
        let toml_copy = location.document_path(
            procedure.equipment_id(),
            procedure.id(),
            DocumentFormat::Toml,
        );
        if toml_copy.exists()
            && let Err(e) = fs::remove_file(&toml_copy)
        {
            warn!(path = %toml_copy.display(), "Failed to remove superseded TOML copy: {e}");
        }

        self.invalidate_cache(procedure.equipment_id());
        debug!(
            equipment = %procedure.equipment_id(),
            procedure = %procedure.id(),
            path = %target.display(),
            "Installed procedure"
        );
        Ok(procedure.summary(ProcedureOrigin::User))
    }

    fn scan(&self, equipment: &EquipmentId) -> Result<Vec<ProcedureSummary>, CatalogError> {
        let mut found: BTreeMap<ProcedureId, ProcedureSummary> = BTreeMap::new();

        for location in &self.locations {
            let dir = location.equipment_dir(equipment);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => return Err(CatalogError::Io { path: dir, source }),
            };

            let mut paths: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| DocumentFormat::from_path(path).is_some())
                .collect();
            paths.sort();

            for path in paths {
                let procedure = match read_procedure(&path)
                    .and_then(|p| check_placement(&path, equipment, p))
                {
                    Ok(procedure) => procedure,
                    Err(e) => {
                        warn!(path = %path.display(), "Skipping procedure document: {e}");
                        continue;
                    }
                };
                // Earlier locations win; user locations sort first.
                found
                    .entry(procedure.id().clone())
                    .or_insert_with(|| procedure.summary(location.origin));
            }
        }

        Ok(found.into_values().collect())
    }

    fn locate(&self, equipment: &EquipmentId, procedure: &ProcedureId) -> Option<PathBuf> {
        self.locations.iter().find_map(|location| {
            DocumentFormat::ALL
                .iter()
                .map(|&format| location.document_path(equipment, procedure, format))
                .find(|path| path.is_file())
        })
    }
}

/// The document must describe the equipment/procedure its path claims.
fn check_placement(
    path: &Path,
    equipment: &EquipmentId,
    procedure: Procedure,
) -> Result<Procedure, CatalogError> {
    if procedure.equipment_id() != equipment {
        return Err(CatalogError::Parse {
            path: path.to_path_buf(),
            message: format!(
                "document equipmentId {} does not match directory {equipment}",
                procedure.equipment_id()
            ),
        });
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if procedure.id().as_str() != stem {
        return Err(CatalogError::Parse {
            path: path.to_path_buf(),
            message: format!(
                "document id {} does not match file name {stem}",
                procedure.id()
            ),
        });
    }
    Ok(procedure)
}

impl ProcedureCatalog for ProcedureStore {
    fn list_procedures(
        &self,
        equipment: &EquipmentId,
    ) -> Result<Vec<ProcedureSummary>, CatalogError> {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(equipment)
        {
            return Ok(cached.clone());
        }

        let summaries = self.scan(equipment)?;
        debug!(
            equipment = %equipment,
            count = summaries.len(),
            "Scanned procedure locations"
        );
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(equipment.clone(), summaries.clone());
        Ok(summaries)
    }

    fn load_procedure(
        &self,
        equipment: &EquipmentId,
        procedure: &ProcedureId,
    ) -> Result<Procedure, CatalogError> {
        let path = self
            .locate(equipment, procedure)
            .ok_or_else(|| CatalogError::NotFound {
                equipment: equipment.clone(),
                procedure: procedure.clone(),
            })?;
        let loaded = read_procedure(&path)?;
        check_placement(&path, equipment, loaded)
    }
}

// ── In-memory catalog ────────────────────────────────────────

/// Fixed set of already-validated procedures.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    procedures: HashMap<(EquipmentId, ProcedureId), Procedure>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a procedure.
    pub fn insert(&mut self, procedure: Procedure) {
        let key = (procedure.equipment_id().clone(), procedure.id().clone());
        self.procedures.insert(key, procedure);
    }

    #[must_use]
    pub fn with(mut self, procedure: Procedure) -> Self {
        self.insert(procedure);
        self
    }
}

impl ProcedureCatalog for InMemoryCatalog {
    fn list_procedures(
        &self,
        equipment: &EquipmentId,
    ) -> Result<Vec<ProcedureSummary>, CatalogError> {
        let mut summaries: Vec<ProcedureSummary> = self
            .procedures
            .values()
            .filter(|p| p.equipment_id() == equipment)
            .map(|p| p.summary(ProcedureOrigin::Bundled))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    fn load_procedure(
        &self,
        equipment: &EquipmentId,
        procedure: &ProcedureId,
    ) -> Result<Procedure, CatalogError> {
        self.procedures
            .get(&(equipment.clone(), procedure.clone()))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                equipment: equipment.clone(),
                procedure: procedure.clone(),
            })
    }
}
