use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker_dispatch cannot be called from inside a worker session")]
    NestedDispatch,

    #[error("at concurrency limit ({0} workers already running)")]
    ConcurrencyLimit(usize),

    #[error("tool '{0}' is not in the worker allow-list")]
    ToolNotAllowed(String),

    #[error("worker {0} not found")]
    NotFound(Uuid),

    #[error("worker {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("could not resolve a model for this worker")]
    ModelUnresolved,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
