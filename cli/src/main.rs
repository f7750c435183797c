//! Pitstop command-line driver.

mod render;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pitstop_engine::{
    DependencyEngine, EnginePhase, EquipmentId, NonEmptyString, PitstopConfig, ProcedureCatalog,
    ProcedureId, Rating, StepId, StoragePaths, base_dir,
};
use pitstop_store::{ProgressStore, export_history, import_history_file, read_procedure};

#[derive(Parser)]
#[command(name = "pitstop")]
#[command(about = "Track progress through dependency-ordered repair procedures")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List procedures available for a piece of equipment
    List { equipment: String },
    /// Show step status for a procedure
    Show {
        equipment: String,
        procedure: String,
        /// Print the engine snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Complete one or more steps, in order
    Complete {
        equipment: String,
        procedure: String,
        #[arg(required = true)]
        steps: Vec<u32>,
        /// Log a history entry under this name if the procedure finishes
        #[arg(long)]
        equipment_name: Option<String>,
        /// Rating (1-5) for the history entry
        #[arg(long, requires = "equipment_name")]
        rating: Option<u8>,
        /// Notes for the history entry
        #[arg(long, requires = "equipment_name")]
        notes: Option<String>,
    },
    /// Reopen a completed step
    Uncomplete {
        equipment: String,
        procedure: String,
        step: u32,
    },
    /// Clear all progress for a procedure
    Reset { equipment: String, procedure: String },
    /// Check a procedure document without installing it
    Validate { file: PathBuf },
    /// Validate a procedure document and copy it into the user location
    Install { file: PathBuf },
    /// Show, export or import completion history
    History {
        #[arg(long, conflicts_with = "import")]
        export: Option<PathBuf>,
        #[arg(long)]
        import: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Command output owns stdout; without a log file, log nowhere.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(base) = base_dir() {
        candidates.push(base.join("logs").join("pitstop.log"));
    }
    candidates.push(PathBuf::from(".pitstop").join("logs").join("pitstop.log"));
    candidates
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = PitstopConfig::load()
        .context("failed to load pitstop config")?
        .unwrap_or_default();
    let paths = config.storage_paths();

    match cli.command {
        Commands::List { equipment } => list(&paths, &parse_equipment(&equipment)?),
        Commands::Show {
            equipment,
            procedure,
            json,
        } => {
            let engine = open_session(&paths, &equipment, &procedure)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
            } else {
                print!("{}", render::session(&engine));
            }
            Ok(())
        }
        Commands::Complete {
            equipment,
            procedure,
            steps,
            equipment_name,
            rating,
            notes,
        } => {
            let mut engine = open_session(&paths, &equipment, &procedure)?;
            for raw in steps {
                let step = parse_step(raw)?;
                engine
                    .complete(step)
                    .with_context(|| format!("cannot complete step {step}"))?;
            }
            if engine.phase() == EnginePhase::Completed
                && let Some(name) = equipment_name
            {
                let rating = rating.map(Rating::new).transpose()?;
                let notes = notes.and_then(|n| NonEmptyString::new(n).ok());
                let record = engine.record_completion(&name, rating, notes)?;
                println!("Logged completion {}", record.id);
            }
            print!("{}", render::session(&engine));
            Ok(())
        }
        Commands::Uncomplete {
            equipment,
            procedure,
            step,
        } => {
            let mut engine = open_session(&paths, &equipment, &procedure)?;
            let step = parse_step(step)?;
            engine
                .uncomplete(step)
                .with_context(|| format!("cannot reopen step {step}"))?;
            print!("{}", render::session(&engine));
            Ok(())
        }
        Commands::Reset {
            equipment,
            procedure,
        } => {
            let mut engine = open_session(&paths, &equipment, &procedure)?;
            engine.reset().context("failed to reset progress")?;
            print!("{}", render::session(&engine));
            Ok(())
        }
        Commands::Validate { file } => validate(&file),
        Commands::Install { file } => {
            let summary = paths
                .procedure_store()
                .install_procedure_file(&file)
                .with_context(|| format!("failed to install {}", file.display()))?;
            println!("Installed {}", render::summary_line(&summary));
            Ok(())
        }
        Commands::History { export, import } => history(&paths, export, import),
    }
}

fn parse_equipment(raw: &str) -> Result<EquipmentId> {
    EquipmentId::new(raw).with_context(|| format!("invalid equipment id {raw:?}"))
}

fn parse_step(raw: u32) -> Result<StepId> {
    StepId::try_new(raw).with_context(|| format!("invalid step id {raw}"))
}

fn open_session(paths: &StoragePaths, equipment: &str, procedure: &str) -> Result<DependencyEngine> {
    let equipment = parse_equipment(equipment)?;
    let procedure =
        ProcedureId::new(procedure).with_context(|| format!("invalid procedure id {procedure:?}"))?;

    let mut engine = paths
        .open_engine()
        .with_context(|| format!("failed to open {}", paths.progress_db.display()))?;
    engine
        .load(&procedure, &equipment)
        .with_context(|| format!("failed to load {equipment}/{procedure}"))?;
    Ok(engine)
}

fn list(paths: &StoragePaths, equipment: &EquipmentId) -> Result<()> {
    let summaries = paths
        .procedure_store()
        .list_procedures(equipment)
        .with_context(|| format!("failed to list procedures for {equipment}"))?;
    if summaries.is_empty() {
        println!("No procedures for {equipment}");
    }
    for summary in &summaries {
        println!("{}", render::summary_line(summary));
    }
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    match read_procedure(file) {
        Ok(procedure) => {
            println!(
                "{}: ok ({} steps, {} entry)",
                file.display(),
                procedure.step_count(),
                procedure.entry_steps().len()
            );
            Ok(())
        }
        Err(err) => bail!("{}: {err}", file.display()),
    }
}

fn history(paths: &StoragePaths, export: Option<PathBuf>, import: Option<PathBuf>) -> Result<()> {
    let store = paths
        .open_progress_store()
        .with_context(|| format!("failed to open {}", paths.progress_db.display()))?;

    if let Some(path) = export {
        let count = export_history(&store, &path)
            .with_context(|| format!("failed to export history to {}", path.display()))?;
        println!("Exported {count} records to {}", path.display());
        return Ok(());
    }
    if let Some(path) = import {
        let added = import_history_file(&store, &path)
            .with_context(|| format!("failed to import history from {}", path.display()))?;
        println!("Imported {added} new records");
        return Ok(());
    }

    for record in store.completion_history()? {
        println!("{}", render::history_line(&record));
    }
    Ok(())
}
