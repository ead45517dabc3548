//! Structured error types for the orchestration core.
//!
//! Each subsystem gets its own `thiserror`-derived enum; [`CoreError`]
//! composes them with `#[from]` so call sites deep in one subsystem can use
//! `?` while callers further up still get a structured variant to match on.
//! The binary entry point wraps everything in `anyhow` once it no longer
//! needs to distinguish error kinds (matching the layering the rest of this
//! codebase already uses between library and application boundary).

use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Projection(#[from] crate::projections::ProjectionError),

    #[error(transparent)]
    Worker(#[from] crate::workers::WorkerError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    #[error(transparent)]
    Dispatch(#[from] crate::dispatcher::DispatchError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
