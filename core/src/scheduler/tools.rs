//! Agent-facing wrappers over [`SchedulerDaemon`] -- `schedule_create`,
//! `schedule_list`, `schedule_delete`. Mirrors the shape of
//! [`crate::workers::tools`]: a thin `Tool` impl per operation, delegating
//! to the shared runtime handle.

use super::daemon::SchedulerDaemon;
use crate::tool::Tool;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub struct ScheduleCreateTool {
    pub daemon: Arc<SchedulerDaemon>,
    pub user_id: String,
    pub channel_id: String,
    pub platform: String,
    pub timezone: String,
}

#[derive(Deserialize)]
struct CreateParams {
    cron_expression: String,
    message: String,
}

#[async_trait::async_trait]
impl Tool for ScheduleCreateTool {
    fn name(&self) -> &str {
        "schedule_create"
    }
    fn description(&self) -> &str {
        "Create a recurring reminder/message on a five-field cron schedule (e.g. '0 9 * * *' for 9am daily)."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "cron_expression": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["cron_expression", "message"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let params: CreateParams = serde_json::from_str(args)?;
        let id = self
            .daemon
            .create_job(&self.user_id, &self.channel_id, &self.platform, &params.cron_expression, &params.message, &self.timezone)
            .await?;
        Ok(id.to_string())
    }
}

pub struct ScheduleListTool {
    pub daemon: Arc<SchedulerDaemon>,
    pub user_id: String,
}

#[async_trait::async_trait]
impl Tool for ScheduleListTool {
    fn name(&self) -> &str {
        "schedule_list"
    }
    fn description(&self) -> &str {
        "List this user's scheduled reminders."
    }
    async fn call(&self, _args: &str) -> anyhow::Result<String> {
        let jobs = self.daemon.list_jobs(&self.user_id);
        Ok(serde_json::to_string(&jobs)?)
    }
}

pub struct ScheduleDeleteTool {
    pub daemon: Arc<SchedulerDaemon>,
}

#[derive(Deserialize)]
struct DeleteParams {
    id: Uuid,
}

#[async_trait::async_trait]
impl Tool for ScheduleDeleteTool {
    fn name(&self) -> &str {
        "schedule_delete"
    }
    fn description(&self) -> &str {
        "Delete a previously created scheduled reminder by id."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let params: DeleteParams = serde_json::from_str(args)?;
        let removed = self.daemon.delete_job(params.id).await?;
        Ok(if removed { "deleted".to_string() } else { "not found".to_string() })
    }
}
