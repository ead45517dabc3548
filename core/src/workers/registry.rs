//! Shared mutable worker map. Generalizes the teacher's `scheduler/store.rs`
//! load-mutate-under-lock shape to an in-memory registry: there is nothing to
//! persist here since workers are cheap to rebuild from `status.json` on
//! restart (`worker_check` falls back to the on-disk file for exactly that
//! reason).

use super::model::{WorkerEntry, WorkerStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct WorkerRegistry {
    entries: Mutex<HashMap<Uuid, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: WorkerEntry) {
        self.entries.lock().insert(entry.id, entry);
    }

    pub fn with_entry<T>(&self, id: Uuid, f: impl FnOnce(&WorkerEntry) -> T) -> Option<T> {
        self.entries.lock().get(&id).map(f)
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut WorkerEntry)) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            f(entry);
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.status == WorkerStatus::Running)
            .count()
    }

    pub fn list_ids(&self) -> Vec<Uuid> {
        self.entries.lock().keys().copied().collect()
    }
}
