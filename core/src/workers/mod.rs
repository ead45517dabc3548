//! Bounded concurrent background sub-agents with scoped file I/O, steering,
//! cancellation, and timeout, completing via a fact inserted into archival
//! memory rather than a direct return value.

mod error;
mod model;
mod registry;
mod runtime;
mod tools;

pub use error::WorkerError;
pub use model::{
    trigger_hint, StatusFile, WorkerDispatchParams, WorkerDispatchResult, WorkerEntry,
    WorkerStatus, WORKER_TOOL_ALLOWLIST,
};
pub use registry::WorkerRegistry;
pub use runtime::WorkerRuntime;
pub use tools::{WorkerCheckTool, WorkerDispatchTool, WorkerInterruptTool, WorkerSteerTool};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn running_count_reflects_registered_entries() {
        let registry = WorkerRegistry::new();
        assert_eq!(registry.running_count(), 0);
        let entry = WorkerEntry {
            id: uuid::Uuid::new_v4(),
            user_id: "u1".to_string(),
            status: WorkerStatus::Running,
            task: "t".to_string(),
            model: "m".to_string(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            error: None,
            result_path: "p".to_string(),
            abort: tokio_util::sync::CancellationToken::new(),
        };
        let id = entry.id;
        registry.register(entry);
        assert_eq!(registry.running_count(), 1);
        registry.update(id, |e| e.status = WorkerStatus::Complete);
        assert_eq!(registry.running_count(), 0);
    }

    #[test]
    fn trigger_hint_matches_the_canonical_fact_prefix() {
        let id = uuid::Uuid::new_v4();
        let hint = trigger_hint(id);
        assert_eq!(hint, format!("worker {id} complete"));
    }

    #[tokio::test]
    async fn remove_evicts_an_entry() {
        let registry = Arc::new(WorkerRegistry::new());
        let entry = WorkerEntry {
            id: uuid::Uuid::new_v4(),
            user_id: "u1".to_string(),
            status: WorkerStatus::Complete,
            task: "t".to_string(),
            model: "m".to_string(),
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            error: None,
            result_path: "p".to_string(),
            abort: tokio_util::sync::CancellationToken::new(),
        };
        let id = entry.id;
        registry.register(entry);
        registry.remove(id);
        assert!(registry.with_entry(id, |_| ()).is_none());
    }
}
