//! Registry entry and on-disk status-file schema for a running worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Complete,
    Failed,
    Timeout,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Complete => "complete",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Timeout => "timeout",
            WorkerStatus::Cancelled => "cancelled",
        }
    }
}

/// In-memory registry entry. The `abort` token is the only handle the
/// registry needs to cancel a running worker; the session itself owns the
/// actual tokio task.
pub struct WorkerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub status: WorkerStatus,
    pub task: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_path: String,
    pub abort: CancellationToken,
}

impl WorkerEntry {
    pub fn to_status_file(&self) -> StatusFile {
        StatusFile {
            worker_id: self.id,
            status: self.status,
            task: self.task.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            model: self.model.clone(),
            error: self.error.clone(),
            result_path: self.result_path.clone(),
        }
    }
}

/// The serialized `status.json` document, per the external filesystem
/// contract: `{worker_id, status, task, started_at, completed_at, model,
/// error, result_path}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub worker_id: Uuid,
    pub status: WorkerStatus,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub model: String,
    pub error: Option<String>,
    pub result_path: String,
}

/// Parameters accepted by `worker_dispatch`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerDispatchParams {
    pub task: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    #[serde(rename = "type")]
    pub worker_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDispatchResult {
    pub worker_id: Uuid,
    pub status: WorkerStatus,
    pub result_path: String,
    pub trigger_hint: String,
}

/// Tools any worker may request; anything outside this set is rejected by
/// `worker_dispatch`.
pub const WORKER_TOOL_ALLOWLIST: &[&str] = &["web_search", "fetch_url"];

pub fn trigger_hint(worker_id: Uuid) -> String {
    format!("worker {worker_id} complete")
}
