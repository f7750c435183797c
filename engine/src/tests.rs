//! Scenario tests for the dependency engine.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pitstop_store::{
    InMemoryCatalog, MemoryProgressStore, PreferenceValue, ProcedureStore, SqliteProgressStore,
    StorageError, StorageLocation,
};
use pitstop_types::{ProgressRecord, Step};
use serde_json::json;

use super::*;

fn step(value: u32) -> StepId {
    StepId::try_new(value).expect("non-zero step id")
}

fn steps(values: &[u32]) -> Vec<StepId> {
    values.iter().map(|&v| step(v)).collect()
}

fn step_set(values: &[u32]) -> BTreeSet<StepId> {
    values.iter().map(|&v| step(v)).collect()
}

fn equipment() -> EquipmentId {
    EquipmentId::new("cb750").expect("valid equipment id")
}

fn procedure_id(name: &str) -> ProcedureId {
    ProcedureId::new(name).expect("valid procedure id")
}

fn build(name: &str, layout: &[(u32, &[u32])]) -> Procedure {
    let steps = layout
        .iter()
        .map(|&(id, requires)| {
            Step::new(step(id), format!("Step {id}"))
                .with_requires(requires.iter().map(|&r| step(r)))
                .with_part_ref(format!("part_{id}"))
        })
        .collect();
    Procedure::new(procedure_id(name), name, equipment(), steps).expect("valid procedure")
}

/// 1 -> {2, 3} -> 4
fn diamond() -> Procedure {
    build("diamond", &[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2, 3])])
}

fn sparse() -> Procedure {
    build("sparse", &[(1, &[]), (2, &[1]), (5, &[1]), (10, &[2, 5])])
}

fn engine_with(procedures: Vec<Procedure>) -> (DependencyEngine, Arc<MemoryProgressStore>) {
    let catalog = procedures
        .into_iter()
        .fold(InMemoryCatalog::new(), InMemoryCatalog::with);
    let progress = Arc::new(MemoryProgressStore::new());
    let engine = DependencyEngine::new(Arc::new(catalog), Arc::clone(&progress) as _);
    (engine, progress)
}

fn loaded_diamond() -> (DependencyEngine, Arc<MemoryProgressStore>) {
    let (mut engine, progress) = engine_with(vec![diamond()]);
    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("load diamond");
    (engine, progress)
}

fn diamond_key() -> ProgressKey {
    ProgressKey::new(equipment(), procedure_id("diamond"))
}

/// Progress store whose writes can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryProgressStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("disk full".into()))
        } else {
            Ok(())
        }
    }
}

impl ProgressStore for FlakyStore {
    fn progress_record(&self, key: &ProgressKey) -> Result<Option<ProgressRecord>, StorageError> {
        self.inner.progress_record(key)
    }

    fn set_completed_steps(
        &self,
        key: &ProgressKey,
        steps: &BTreeSet<StepId>,
    ) -> Result<ProgressRecord, StorageError> {
        self.check()?;
        self.inner.set_completed_steps(key, steps)
    }

    fn clear_progress(&self, key: &ProgressKey) -> Result<(), StorageError> {
        self.check()?;
        self.inner.clear_progress(key)
    }

    fn log_completion(&self, record: &CompletionRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.log_completion(record)
    }

    fn completion_history(&self) -> Result<Vec<CompletionRecord>, StorageError> {
        self.inner.completion_history()
    }

    fn import_history(&self, records: &[CompletionRecord]) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.import_history(records)
    }

    fn preference(&self, key: &str) -> Result<Option<PreferenceValue>, StorageError> {
        self.inner.preference(key)
    }

    fn set_preference(&self, key: &str, value: PreferenceValue) -> Result<(), StorageError> {
        self.check()?;
        self.inner.set_preference(key, value)
    }
}

// ============================================================================
// Load
// ============================================================================

#[test]
fn operations_before_load_fail_with_not_loaded() {
    let (mut engine, _) = engine_with(vec![diamond()]);
    assert_eq!(engine.phase(), EnginePhase::Unloaded);
    assert!(engine.available().is_empty());
    assert!(matches!(engine.complete(step(1)), Err(EngineError::NotLoaded)));
    assert!(matches!(engine.uncomplete(step(1)), Err(EngineError::NotLoaded)));
    assert!(matches!(engine.set_active(step(1)), Err(EngineError::NotLoaded)));
    assert!(matches!(engine.next(), Err(EngineError::NotLoaded)));
    assert!(matches!(engine.previous(), Err(EngineError::NotLoaded)));
    assert!(matches!(engine.reset(), Err(EngineError::NotLoaded)));
    assert!(matches!(
        engine.record_completion("bike", None, None),
        Err(EngineError::NotLoaded)
    ));
    assert_eq!(engine.snapshot(), EngineSnapshot::unloaded());
}

#[test]
fn load_unknown_procedure_is_not_found() {
    let (mut engine, _) = engine_with(vec![diamond()]);
    let err = engine
        .load(&procedure_id("timing-belt"), &equipment())
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
    assert_eq!(engine.phase(), EnginePhase::Unloaded);
}

#[test]
fn failed_load_keeps_previous_session() {
    let (mut engine, _) = engine_with(vec![diamond()]);
    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("load");
    engine.complete(step(1)).expect("complete 1");

    assert!(engine.load(&procedure_id("missing"), &equipment()).is_err());
    assert_eq!(engine.procedure().map(Procedure::id), Some(&procedure_id("diamond")));
    assert_eq!(engine.completed(), &step_set(&[1]));
}

#[test]
fn cyclic_document_is_rejected_at_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let equipment_dir = dir.path().join("cb750");
    std::fs::create_dir_all(&equipment_dir).expect("create equipment dir");
    let doc = json!({
        "id": "loop",
        "name": "Loop",
        "equipmentId": "cb750",
        "steps": [
            { "id": 1, "action": "Entry", "requires": [] },
            { "id": 2, "action": "A", "requires": [3] },
            { "id": 3, "action": "B", "requires": [2] }
        ]
    });
    std::fs::write(
        equipment_dir.join("loop.json"),
        serde_json::to_vec(&doc).expect("serialize"),
    )
    .expect("write document");

    let catalog = ProcedureStore::new(vec![StorageLocation::bundled(dir.path())]);
    let mut engine = DependencyEngine::new(
        Arc::new(catalog),
        Arc::new(MemoryProgressStore::new()),
    );

    let err = engine.load(&procedure_id("loop"), &equipment()).unwrap_err();
    let EngineError::InvariantViolation { source, .. } = &err else {
        panic!("expected invariant violation, got {err:?}");
    };
    let offending: BTreeSet<StepId> = source.offending_steps().into_iter().collect();
    assert_eq!(offending, step_set(&[2, 3]));
}

#[test]
fn load_restores_prior_progress_and_prunes_dangling_ids() {
    let (mut engine, progress) = engine_with(vec![diamond()]);
    progress
        .set_completed_steps(&diamond_key(), &step_set(&[1, 2, 99]))
        .expect("seed progress");

    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("load");

    assert_eq!(engine.completed(), &step_set(&[1, 2]));
    assert_eq!(engine.available(), steps(&[3]).as_slice());
    assert_eq!(engine.active(), Some(step(3)));
    // The pruned set is written back.
    assert_eq!(
        progress.completed_steps(&diamond_key()).expect("read"),
        step_set(&[1, 2])
    );
}

#[test]
fn load_of_fully_completed_progress_is_completed() {
    let (mut engine, progress) = engine_with(vec![diamond()]);
    progress
        .set_completed_steps(&diamond_key(), &step_set(&[1, 2, 3, 4]))
        .expect("seed progress");

    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("load");
    assert_eq!(engine.phase(), EnginePhase::Completed);
    assert!(engine.available().is_empty());
    assert_eq!(engine.active(), None);
}

// ============================================================================
// Complete / uncomplete
// ============================================================================

#[test]
fn diamond_walkthrough() {
    let (mut engine, progress) = loaded_diamond();
    assert_eq!(engine.phase(), EnginePhase::Active);
    assert_eq!(engine.available(), steps(&[1]).as_slice());
    assert_eq!(engine.active(), Some(step(1)));

    engine.complete(step(1)).expect("complete 1");
    assert_eq!(engine.available(), steps(&[2, 3]).as_slice());
    assert_eq!(engine.active(), Some(step(2)));

    engine.complete(step(2)).expect("complete 2");
    assert_eq!(engine.available(), steps(&[3]).as_slice());

    engine.complete(step(3)).expect("complete 3");
    assert_eq!(engine.available(), steps(&[4]).as_slice());
    assert_eq!(engine.active(), Some(step(4)));

    engine.complete(step(4)).expect("complete 4");
    assert_eq!(engine.phase(), EnginePhase::Completed);
    assert!(engine.available().is_empty());
    assert_eq!(engine.active(), None);
    assert_eq!(
        progress.completed_steps(&diamond_key()).expect("read"),
        step_set(&[1, 2, 3, 4])
    );
}

#[test]
fn complete_reports_why_a_step_is_unavailable() {
    let (mut engine, _) = loaded_diamond();

    let err = engine.complete(step(4)).unwrap_err();
    let EngineError::NotAvailable { reason, .. } = &err else {
        panic!("expected NotAvailable, got {err:?}");
    };
    assert_eq!(
        *reason,
        NotAvailableReason::Blocked {
            missing: steps(&[2, 3])
        }
    );

    engine.complete(step(1)).expect("complete 1");
    assert!(matches!(
        engine.complete(step(1)),
        Err(EngineError::NotAvailable {
            reason: NotAvailableReason::AlreadyCompleted,
            ..
        })
    ));
    assert!(matches!(
        engine.complete(step(7)),
        Err(EngineError::NotAvailable {
            reason: NotAvailableReason::UnknownStep,
            ..
        })
    ));
    assert_eq!(engine.completed(), &step_set(&[1]));
}

#[test]
fn sparse_ids_complete_only_when_every_id_is_done() {
    let (mut engine, _) = engine_with(vec![sparse()]);
    engine
        .load(&procedure_id("sparse"), &equipment())
        .expect("load sparse");

    for id in [1, 2, 5] {
        engine.complete(step(id)).expect("complete step");
        assert_eq!(engine.phase(), EnginePhase::Active);
    }
    assert_eq!(engine.available(), steps(&[10]).as_slice());

    engine.complete(step(10)).expect("complete 10");
    assert_eq!(engine.phase(), EnginePhase::Completed);
}

/// `available` is exactly the incomplete steps whose requirements are all
/// completed, in procedure order, and `active` is one of them.
fn assert_available_matches_definition(engine: &DependencyEngine) {
    let procedure = engine.procedure().expect("loaded");
    let expected: Vec<StepId> = procedure
        .steps()
        .iter()
        .filter(|s| !engine.completed().contains(&s.id()))
        .filter(|s| s.requires().is_subset(engine.completed()))
        .map(Step::id)
        .collect();
    assert_eq!(
        engine.available(),
        expected.as_slice(),
        "completed = {:?}",
        engine.completed()
    );
    if let Some(active) = engine.active() {
        assert!(engine.available().contains(&active));
    }
}

#[test]
fn available_matches_definition_after_every_mutation() {
    let (mut engine, _) = loaded_diamond();

    assert_available_matches_definition(&engine);
    for id in [1, 3, 2] {
        engine.complete(step(id)).expect("complete");
        assert_available_matches_definition(&engine);
    }
    engine.uncomplete(step(3)).expect("uncomplete 3");
    assert_available_matches_definition(&engine);
    engine.reset().expect("reset");
    assert_available_matches_definition(&engine);
}

fn replay(procedure: &Procedure, order: &[StepId]) -> DependencyEngine {
    let (mut engine, _) = engine_with(vec![procedure.clone()]);
    engine
        .load(procedure.id(), procedure.equipment_id())
        .expect("load");
    for &id in order {
        engine.complete(id).expect("replayed step is available");
    }
    engine
}

/// Breadth-first walk over every completed set reachable through
/// `complete`. Returns how many distinct sets were visited.
fn walk_reachable_states(procedure: &Procedure) -> usize {
    let mut seen: HashSet<BTreeSet<StepId>> = HashSet::new();
    let mut queue: VecDeque<Vec<StepId>> = VecDeque::from([Vec::new()]);

    while let Some(order) = queue.pop_front() {
        let engine = replay(procedure, &order);
        if !seen.insert(engine.completed().clone()) {
            continue;
        }
        assert_available_matches_definition(&engine);
        assert_eq!(
            engine.phase() == EnginePhase::Completed,
            engine.available().is_empty()
        );

        for &next in engine.available() {
            let mut extended = order.clone();
            extended.push(next);
            let after = replay(procedure, &extended);

            // Completing a step never locks anything that was available.
            let after_available: BTreeSet<StepId> = after.available().iter().copied().collect();
            for &other in engine.available().iter().filter(|&&s| s != next) {
                assert!(
                    after_available.contains(&other),
                    "completing {next} after {order:?} dropped {other}"
                );
            }
            queue.push_back(extended);
        }
    }
    seen.len()
}

#[test]
fn every_reachable_state_keeps_availability_closed_and_monotonic() {
    // {}, {1}, {1,2}, {1,3}, {1,2,3}, everything.
    assert_eq!(walk_reachable_states(&diamond()), 6);
    // {}, {1}, {1,2}, {1,5}, {1,2,5}, everything.
    assert_eq!(walk_reachable_states(&sparse()), 6);
}

#[test]
fn uncomplete_rejects_steps_with_completed_dependents() {
    let (mut engine, _) = loaded_diamond();
    engine.complete(step(1)).expect("complete 1");
    engine.complete(step(2)).expect("complete 2");

    let err = engine.uncomplete(step(1)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::DependentsExist { step: s, ref dependents } if s == step(1) && *dependents == steps(&[2])
    ));
    // No cascade.
    assert_eq!(engine.completed(), &step_set(&[1, 2]));

    assert!(matches!(
        engine.uncomplete(step(3)),
        Err(EngineError::NotCompleted { .. })
    ));
}

#[test]
fn uncomplete_makes_the_step_active() {
    let (mut engine, progress) = loaded_diamond();
    engine.complete(step(1)).expect("complete 1");
    engine.complete(step(2)).expect("complete 2");
    engine.complete(step(3)).expect("complete 3");
    assert_eq!(engine.active(), Some(step(4)));

    engine.uncomplete(step(3)).expect("uncomplete 3");
    assert_eq!(engine.active(), Some(step(3)));
    assert_eq!(engine.available(), steps(&[3]).as_slice());
    assert_eq!(
        progress.completed_steps(&diamond_key()).expect("read"),
        step_set(&[1, 2])
    );
}

#[test]
fn uncomplete_reopens_a_completed_procedure() {
    let (mut engine, _) = loaded_diamond();
    for id in [1, 2, 3, 4] {
        engine.complete(step(id)).expect("complete");
    }
    assert_eq!(engine.phase(), EnginePhase::Completed);

    engine.uncomplete(step(4)).expect("uncomplete 4");
    assert_eq!(engine.phase(), EnginePhase::Active);
    assert_eq!(engine.active(), Some(step(4)));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn progress_round_trips_across_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("progress.db");
    let catalog: Arc<dyn ProcedureCatalog> = Arc::new(InMemoryCatalog::new().with(diamond()));

    {
        let store = SqliteProgressStore::open(&db).expect("open store");
        let mut engine = DependencyEngine::new(Arc::clone(&catalog), Arc::new(store));
        engine
            .load(&procedure_id("diamond"), &equipment())
            .expect("load");
        engine.complete(step(1)).expect("complete 1");
    }

    let store = SqliteProgressStore::open(&db).expect("reopen store");
    let mut engine = DependencyEngine::new(catalog, Arc::new(store));
    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("reload");
    assert_eq!(engine.completed(), &step_set(&[1]));
    assert_eq!(engine.available(), steps(&[2, 3]).as_slice());
}

#[test]
fn failed_writes_leave_state_untouched() {
    let store = Arc::new(FlakyStore::default());
    let catalog = InMemoryCatalog::new().with(diamond());
    let mut engine = DependencyEngine::new(Arc::new(catalog), Arc::clone(&store) as _);
    engine
        .load(&procedure_id("diamond"), &equipment())
        .expect("load");
    engine.complete(step(1)).expect("complete 1");
    let before = engine.snapshot();

    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.complete(step(2)),
        Err(EngineError::Storage(_))
    ));
    assert_eq!(engine.snapshot(), before);

    assert!(matches!(
        engine.uncomplete(step(1)),
        Err(EngineError::Storage(_))
    ));
    assert_eq!(engine.snapshot(), before);

    assert!(matches!(engine.reset(), Err(EngineError::Storage(_))));
    assert_eq!(engine.snapshot(), before);

    store.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(
        store.completed_steps(&diamond_key()).expect("read"),
        step_set(&[1])
    );
}

#[test]
fn reset_clears_memory_and_storage() {
    let (mut engine, progress) = loaded_diamond();
    engine.complete(step(1)).expect("complete 1");
    engine.complete(step(3)).expect("complete 3");

    engine.reset().expect("reset");
    assert!(engine.completed().is_empty());
    assert_eq!(engine.available(), steps(&[1]).as_slice());
    assert_eq!(engine.active(), Some(step(1)));
    assert!(
        progress
            .progress_record(&diamond_key())
            .expect("read")
            .is_none()
    );
}

// ============================================================================
// Navigation
// ============================================================================

#[test]
fn next_and_previous_walk_available_steps() {
    let procedure = build("wide", &[(1, &[]), (4, &[]), (2, &[]), (3, &[1])]);
    let (mut engine, _) = engine_with(vec![procedure]);
    engine
        .load(&procedure_id("wide"), &equipment())
        .expect("load");

    // Stable order is document order, not id order.
    assert_eq!(engine.available(), steps(&[1, 4, 2]).as_slice());
    assert_eq!(engine.active(), Some(step(1)));

    assert!(!engine.previous().expect("previous at start"));
    assert!(engine.next().expect("next"));
    assert_eq!(engine.active(), Some(step(4)));
    assert!(engine.next().expect("next"));
    assert_eq!(engine.active(), Some(step(2)));
    assert!(!engine.next().expect("next at end"));
    assert!(engine.previous().expect("previous"));
    assert_eq!(engine.active(), Some(step(4)));
}

#[test]
fn set_active_only_accepts_available_steps() {
    let (mut engine, _) = loaded_diamond();
    engine.complete(step(1)).expect("complete 1");

    engine.set_active(step(3)).expect("activate 3");
    assert_eq!(engine.active(), Some(step(3)));
    assert!(matches!(
        engine.set_active(step(4)),
        Err(EngineError::NotAvailable { .. })
    ));
    assert!(matches!(
        engine.set_active(step(1)),
        Err(EngineError::NotAvailable {
            reason: NotAvailableReason::AlreadyCompleted,
            ..
        })
    ));
    assert_eq!(engine.active(), Some(step(3)));
}

// ============================================================================
// Snapshot, observers, history
// ============================================================================

#[test]
fn snapshot_exposes_part_refs_for_highlighting() {
    let (mut engine, _) = loaded_diamond();
    engine.complete(step(1)).expect("complete 1");

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, EnginePhase::Active);
    assert_eq!(snapshot.highlighted_parts, vec!["part_2", "part_3"]);
    assert_eq!(snapshot.active_part.as_deref(), Some("part_2"));
    assert_eq!(snapshot.completed_count, 1);
    assert_eq!(snapshot.total_steps, 4);
}

#[test]
fn observers_see_changes_until_unsubscribed() {
    let (mut engine, _) = loaded_diamond();
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&events);
    let id = engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    engine.complete(step(1)).expect("complete 1");
    engine.complete(step(2)).expect("complete 2");
    engine.complete(step(3)).expect("complete 3");
    engine.complete(step(4)).expect("complete 4");

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(
            events.last(),
            Some(EngineEvent::ProcedureCompleted { .. })
        ));
        let EngineEvent::StateChanged(first) = &events[0] else {
            panic!("expected state change first");
        };
        assert_eq!(first.available, steps(&[2, 3]));
    }

    assert!(engine.unsubscribe(id));
    assert!(!engine.unsubscribe(id));
    engine.reset().expect("reset");
    assert_eq!(events.lock().unwrap().len(), 5);
}

#[test]
fn failed_operations_do_not_notify() {
    let (mut engine, _) = loaded_diamond();
    let count = Arc::new(Mutex::new(0_usize));
    let sink = Arc::clone(&count);
    engine.subscribe(move |_| *sink.lock().unwrap() += 1);

    assert!(engine.complete(step(4)).is_err());
    assert!(engine.set_active(step(2)).is_err());
    assert!(!engine.previous().expect("previous"));
    assert_eq!(*count.lock().unwrap(), 0);
}

#[test]
fn record_completion_requires_finished_procedure() {
    let (mut engine, progress) = loaded_diamond();
    assert!(matches!(
        engine.record_completion("Shop bike", None, None),
        Err(EngineError::NotFinished)
    ));

    for id in [1, 2, 3, 4] {
        engine.complete(step(id)).expect("complete");
    }
    let rating = Rating::new(5).expect("valid rating");
    let notes = NonEmptyString::new("Smooth").expect("non-empty");
    let record = engine
        .record_completion("Shop bike", Some(rating), Some(notes))
        .expect("record");

    assert_eq!(record.procedure_id, procedure_id("diamond"));
    assert_eq!(record.equipment_name, "Shop bike");
    assert!(record.completed_at >= record.started_at);
    assert_eq!(
        progress.completion_history().expect("history"),
        vec![record]
    );
}
