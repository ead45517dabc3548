//! Agent-facing wrappers over [`WorkerRuntime`] -- these are what actually
//! get registered into a session's [`ToolRegistry`](crate::tool::ToolRegistry).

use super::model::WorkerDispatchParams;
use super::runtime::WorkerRuntime;
use crate::tool::{Capability, Tool};
use std::sync::Arc;
use uuid::Uuid;

pub struct WorkerDispatchTool {
    pub runtime: Arc<WorkerRuntime>,
    pub primary_model: String,
    pub fallback_models: Vec<String>,
    pub worker_tools: crate::tool::ToolRegistry,
}

#[async_trait::async_trait]
impl Tool for WorkerDispatchTool {
    fn name(&self) -> &str {
        "worker_dispatch"
    }
    fn description(&self) -> &str {
        "Spawn a background worker to complete a task independently. Returns a trigger_hint \
         suitable for use as a projection's trigger_on_fact."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": { "type": "string" },
                "tools": { "type": "array", "items": { "type": "string" } },
                "model": { "type": "string" },
                "timeout_seconds": { "type": "integer" },
                "type": { "type": "string" }
            },
            "required": ["task"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let params: WorkerDispatchParams = serde_json::from_str(args)?;
        let result = self
            .runtime
            .dispatch(params, &self.primary_model, &self.fallback_models, self.worker_tools.clone())
            .await?;
        Ok(serde_json::to_string(&result)?)
    }
}

pub struct WorkerCheckTool {
    pub runtime: Arc<WorkerRuntime>,
}

#[async_trait::async_trait]
impl Tool for WorkerCheckTool {
    fn name(&self) -> &str {
        "worker_check"
    }
    fn description(&self) -> &str {
        "Check a worker's current status."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "worker_id": { "type": "string" } },
            "required": ["worker_id"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let parsed: serde_json::Value = serde_json::from_str(args)?;
        let id = parse_worker_id(&parsed)?;
        let status = self.runtime.check(id).await?;
        Ok(serde_json::to_string(&status)?)
    }
}

pub struct WorkerInterruptTool {
    pub runtime: Arc<WorkerRuntime>,
}

#[async_trait::async_trait]
impl Tool for WorkerInterruptTool {
    fn name(&self) -> &str {
        "worker_interrupt"
    }
    fn description(&self) -> &str {
        "Cancel a running worker."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "worker_id": { "type": "string" } },
            "required": ["worker_id"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let parsed: serde_json::Value = serde_json::from_str(args)?;
        let id = parse_worker_id(&parsed)?;
        let status = self.runtime.interrupt(id).await?;
        Ok(serde_json::to_string(&status)?)
    }
}

pub struct WorkerSteerTool {
    pub runtime: Arc<WorkerRuntime>,
}

#[async_trait::async_trait]
impl Tool for WorkerSteerTool {
    fn name(&self) -> &str {
        "worker_steer"
    }
    fn description(&self) -> &str {
        "Send new guidance to a running worker; it polls for this periodically."
    }
    fn capability(&self) -> Capability {
        Capability::Safe
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "worker_id": { "type": "string" },
                "guidance": { "type": "string" }
            },
            "required": ["worker_id", "guidance"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let parsed: serde_json::Value = serde_json::from_str(args)?;
        let id = parse_worker_id(&parsed)?;
        let guidance = parsed
            .get("guidance")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'guidance'"))?;
        self.runtime.steer(id, guidance).await?;
        Ok("ok".to_string())
    }
}

fn parse_worker_id(value: &serde_json::Value) -> anyhow::Result<Uuid> {
    let raw = value
        .get("worker_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'worker_id'"))?;
    Ok(Uuid::parse_str(raw)?)
}
