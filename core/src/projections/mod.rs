//! Durable store of future commitments: exact/day/week/month/someday
//! resolution, recurrence, keyword+semantic triggers, a dependency DAG
//! with cycle/depth checks, and an auto-expiry sweeper.

mod dag;
mod error;
mod model;
mod store;

pub use error::{InvariantError, ProjectionError};
pub use model::{
    ConditionType, NewDependency, NewProjection, Projection, ProjectionDependency,
    ProjectionStatus, Resolution,
};
pub use store::{Embedder, ProjectionStore};
