//! Observer registration for engine state changes.
//!
//! Observers are owned by the engine and dropped on `unsubscribe`, so a
//! caller that forgets its subscription id leaks at most one boxed closure
//! for the lifetime of the engine, never a dangling callback.

use std::fmt;

use chrono::{DateTime, Utc};
use pitstop_types::{EquipmentId, ProcedureId};

use crate::state::EngineSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Emitted after every successful state change.
    StateChanged(EngineSnapshot),
    /// Emitted once when a session moves into the `Completed` phase.
    ProcedureCompleted {
        equipment_id: EquipmentId,
        procedure_id: ProcedureId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Callback = Box<dyn FnMut(&EngineEvent) + Send>;

#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Callback)>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("next_id", &self.next_id)
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Observers {
    pub(crate) fn subscribe(&mut self, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, callback));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver in subscription order.
    pub(crate) fn notify(&mut self, event: &EngineEvent) {
        for (_, callback) in &mut self.entries {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{EngineEvent, Observers};
    use crate::state::EngineSnapshot;

    #[test]
    fn ids_are_never_reused() {
        let mut observers = Observers::default();
        let first = observers.subscribe(Box::new(|_| {}));
        assert!(observers.unsubscribe(first));
        let second = observers.subscribe(Box::new(|_| {}));
        assert_ne!(first, second);
        assert!(!observers.unsubscribe(first));
    }

    #[test]
    fn notify_reaches_only_live_subscribers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::default();

        let log = Arc::clone(&seen);
        let kept = observers.subscribe(Box::new(move |_| log.lock().unwrap().push("kept")));
        let log = Arc::clone(&seen);
        let dropped = observers.subscribe(Box::new(move |_| log.lock().unwrap().push("dropped")));
        assert!(observers.unsubscribe(dropped));

        observers.notify(&EngineEvent::StateChanged(EngineSnapshot::unloaded()));
        assert_eq!(*seen.lock().unwrap(), vec!["kept"]);
        assert!(observers.unsubscribe(kept));
        assert!(observers.is_empty());
    }
}
