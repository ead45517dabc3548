//! Projection and dependency row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Exact,
    Day,
    Week,
    Month,
    Someday,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Exact => "exact",
            Resolution::Day => "day",
            Resolution::Week => "week",
            Resolution::Month => "month",
            Resolution::Someday => "someday",
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Resolution::Exact),
            "day" => Ok(Resolution::Day),
            "week" => Ok(Resolution::Week),
            "month" => Ok(Resolution::Month),
            "someday" => Ok(Resolution::Someday),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Pending,
    Done,
    Cancelled,
    Passed,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Pending => "pending",
            ProjectionStatus::Done => "done",
            ProjectionStatus::Cancelled => "cancelled",
            ProjectionStatus::Passed => "passed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProjectionStatus::Pending)
    }
}

impl std::str::FromStr for ProjectionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProjectionStatus::Pending),
            "done" => Ok(ProjectionStatus::Done),
            "cancelled" => Ok(ProjectionStatus::Cancelled),
            "passed" => Ok(ProjectionStatus::Passed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    StatusChange,
    Llm,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::StatusChange => "status_change",
            ConditionType::Llm => "llm",
        }
    }

    /// `condition_type` defaults to `status_change` when the condition text
    /// names one of the terminal statuses; otherwise it's an `llm` predicate.
    pub fn infer(condition: &str) -> ConditionType {
        match condition {
            "done" | "cancelled" | "passed" => ConditionType::StatusChange,
            _ => ConditionType::Llm,
        }
    }
}

impl std::str::FromStr for ConditionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status_change" => Ok(ConditionType::StatusChange),
            "llm" => Ok(ConditionType::Llm),
            other => Err(format!("unknown condition_type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub id: Uuid,
    pub summary: String,
    pub raw_when: Option<String>,
    pub resolved_when: Option<DateTime<Utc>>,
    pub resolution: Resolution,
    pub recurrence: Option<String>,
    pub trigger_on_fact: Option<String>,
    pub context: Option<String>,
    pub linked_ids: Vec<Uuid>,
    pub status: ProjectionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionDependency {
    pub id: Uuid,
    pub observer_id: Uuid,
    pub subject_id: Uuid,
    pub condition: String,
    pub condition_type: ConditionType,
    pub created_at: DateTime<Utc>,
}

/// A dependency the caller wants inserted alongside a new projection, or via
/// `linkDependency` directly.
#[derive(Debug, Clone)]
pub struct NewDependency {
    pub subject_id: Uuid,
    pub condition: String,
    pub condition_type: Option<ConditionType>,
}

#[derive(Debug, Clone, Default)]
pub struct NewProjection {
    pub summary: String,
    pub raw_when: Option<String>,
    pub resolved_when: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub recurrence: Option<String>,
    pub trigger_on_fact: Option<String>,
    pub context: Option<String>,
    pub linked_ids: Vec<Uuid>,
    pub depends_on: Vec<NewDependency>,
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Someday
    }
}
