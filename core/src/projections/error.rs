//! Error kinds for the projection store.
//!
//! Neither variant is retried by the store itself -- both propagate to the
//! calling tool, which turns an [`InvariantError`] into a structured tool
//! error the agent can see and reason about.

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("dependency invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("projection not found: {0}")]
    NotFound(uuid::Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("a projection cannot depend on itself")]
    SelfDependency,
    #[error("dependency cycle detected")]
    Cycle,
    #[error("dependency chain deeper than 5")]
    DepthExceeded,
    #[error("dependency subject {0} does not exist")]
    MissingSubject(uuid::Uuid),
    #[error("condition_type 'llm' is not implemented; rejected at the store boundary")]
    UnimplementedConditionType,
}
