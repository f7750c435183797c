//! Plain-text rendering of engine state and store listings.

use std::fmt::Write;

use pitstop_engine::{DependencyEngine, EnginePhase};
use pitstop_types::{CompletionRecord, ProcedureSummary, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMark {
    Done,
    Active,
    Ready,
    Blocked,
}

impl StepMark {
    const fn glyph(self) -> &'static str {
        match self {
            Self::Done => "[x]",
            Self::Active => "[>]",
            Self::Ready => "[ ]",
            Self::Blocked => "[-]",
        }
    }
}

fn mark(engine: &DependencyEngine, step: &Step) -> StepMark {
    let id = step.id();
    if engine.completed().contains(&id) {
        StepMark::Done
    } else if engine.active() == Some(id) {
        StepMark::Active
    } else if engine.available().contains(&id) {
        StepMark::Ready
    } else {
        StepMark::Blocked
    }
}

pub(crate) fn session(engine: &DependencyEngine) -> String {
    let Some(procedure) = engine.procedure() else {
        return "No procedure loaded\n".to_owned();
    };

    let mut out = String::new();
    let status = match engine.phase() {
        EnginePhase::Completed => "complete",
        EnginePhase::Active | EnginePhase::Unloaded => "in progress",
    };
    let _ = writeln!(
        out,
        "{} ({}/{}) - {}/{} steps, {status}",
        procedure.name(),
        procedure.equipment_id(),
        procedure.id(),
        engine.completed().len(),
        procedure.step_count(),
    );

    for step in procedure.steps() {
        let _ = write!(
            out,
            "  {} {:>3}. {}",
            mark(engine, step).glyph(),
            step.id(),
            step.action()
        );
        if let Some(part) = step.part_ref() {
            let _ = write!(out, " <{part}>");
        }
        if !step.requires().is_empty() {
            let requires: Vec<String> = step.requires().iter().map(ToString::to_string).collect();
            let _ = write!(out, " (after {})", requires.join(", "));
        }
        out.push('\n');
    }
    out
}

pub(crate) fn summary_line(summary: &ProcedureSummary) -> String {
    format!(
        "{:<24} {:<32} {:>3} steps  [{}]",
        summary.id.as_str(),
        summary.name,
        summary.step_count,
        summary.origin.as_str()
    )
}

pub(crate) fn history_line(record: &CompletionRecord) -> String {
    let minutes = record.duration().num_minutes();
    let mut line = format!(
        "{}  {}/{}  {}  {minutes} min",
        record.completed_at.format("%Y-%m-%d %H:%M"),
        record.equipment_id,
        record.procedure_id,
        record.equipment_name,
    );
    if let Some(rating) = record.rating {
        let _ = write!(line, "  {}/5", rating.value());
    }
    if let Some(notes) = &record.notes {
        let _ = write!(line, "  \"{}\"", notes.as_str());
    }
    line
}
