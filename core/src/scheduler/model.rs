//! The three job classes the unified driver fires, and the on-disk shape of
//! the agent-managed ones. Generalized from the teacher's `ScheduledJob`
//! (whose `JobSchedule::Cron` variant was an unimplemented stub) into a
//! single cron-only job: every job here ultimately just emits one synthetic
//! message into a channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// An operator-configured cron job read straight out of `config.yml`.
/// Ephemeral: rebuilt from config on every startup, never persisted, never
/// mutated by the agent.
#[derive(Debug, Clone)]
pub struct OperatorJob {
    pub cron_expression: String,
    pub message: String,
}

/// A job the agent created at runtime via `schedule_create`, persisted to
/// `schedules.json` so it survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJob {
    pub id: JobId,
    pub user_id: String,
    pub channel_id: String,
    pub platform: String,
    pub cron_expression: String,
    pub message: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl AgentJob {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        platform: impl Into<String>,
        cron_expression: impl Into<String>,
        message: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            platform: platform.into(),
            cron_expression: cron_expression.into(),
            message: message.into(),
            timezone: timezone.into(),
            created_at: Utc::now(),
            last_fired_at: None,
        }
    }
}

/// The two built-in projection-maintenance jobs, fixed schedules, not
/// persisted, not user-creatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceJob {
    /// 08:00 UTC: auto-expire stale projections, then list the upcoming 7
    /// days.
    DailyReview,
    /// Every 15 minutes: list anything due in the next hour.
    ExactTimeCheck,
}

impl MaintenanceJob {
    pub fn cron_expression(self) -> &'static str {
        match self {
            MaintenanceJob::DailyReview => "0 8 * * *",
            MaintenanceJob::ExactTimeCheck => "*/15 * * * *",
        }
    }
}
