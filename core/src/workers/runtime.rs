//! Spawns, tracks, steers, and cancels background sub-agents.
//!
//! A worker runs one bounded tool-calling loop against the same
//! [`LlmClient`](crate::llm::LlmClient) the main session uses, scoped to its
//! own working directory and its own small tool set. It never runs nested:
//! `worker_dispatch` rejects a call made from inside a worker session, and
//! communicates results only through files in its directory plus a single
//! fact inserted into the user's archival memory.

use super::error::WorkerError;
use super::model::{
    trigger_hint, StatusFile, WorkerDispatchParams, WorkerDispatchResult, WorkerEntry,
    WorkerStatus, WORKER_TOOL_ALLOWLIST,
};
use super::registry::WorkerRegistry;
use crate::config::{WorkerTypeConfig, WorkersConfig};
use crate::llm::chat::{ChatMessage, ChatRequest};
use crate::llm::LlmClient;
use crate::memory::FactSink;
use crate::tool::{Capability, Tool, ToolRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_TOOL_TURNS: usize = 8;
const DEFAULT_TIMEOUT_SECS: u64 = 600;
const EVICT_AFTER_HOURS: i64 = 24;
const MAX_WORKER_FILE_BYTES: u64 = 100 * 1024;
const RESERVED_FILENAMES: &[&str] = &["status.json", "task.md", "steering.md"];

pub struct WorkerRuntime {
    registry: Arc<WorkerRegistry>,
    llm: Arc<LlmClient>,
    fact_sink: Arc<dyn FactSink>,
    data_dir: PathBuf,
    config: WorkersConfig,
    user_id: String,
    /// True while running inside an already-dispatched worker; blocks
    /// recursive `worker_dispatch` calls.
    is_worker_context: bool,
}

impl WorkerRuntime {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        llm: Arc<LlmClient>,
        fact_sink: Arc<dyn FactSink>,
        data_dir: PathBuf,
        config: WorkersConfig,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            llm,
            fact_sink,
            data_dir,
            config,
            user_id: user_id.into(),
            is_worker_context: false,
        }
    }

    /// A runtime scoped to run *inside* a worker, so a nested
    /// `worker_dispatch` call fails fast instead of silently recursing.
    pub fn as_worker_context(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            llm: self.llm.clone(),
            fact_sink: self.fact_sink.clone(),
            data_dir: self.data_dir.clone(),
            config: self.config.clone(),
            user_id: self.user_id.clone(),
            is_worker_context: true,
        }
    }

    fn worker_dir(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("files").join("workers").join(id.to_string())
    }

    fn resolve_model(
        &self,
        params: &WorkerDispatchParams,
        primary_model: &str,
        fallback_models: &[String],
    ) -> Option<String> {
        if let Some(m) = &params.model {
            return Some(m.clone());
        }
        if let Some(type_name) = &params.worker_type {
            if let Some(WorkerTypeConfig { model: Some(m), .. }) = self.config.types.get(type_name) {
                return Some(m.clone());
            }
        }
        if let Some(m) = &self.config.model {
            return Some(m.clone());
        }
        if let Some(m) = fallback_models.first() {
            return Some(m.clone());
        }
        Some(primary_model.to_string())
    }

    fn resolve_tools(&self, params: &WorkerDispatchParams) -> Result<Vec<String>, WorkerError> {
        let mut requested = params.tools.clone();
        if let Some(type_name) = &params.worker_type {
            if requested.is_empty() {
                if let Some(type_cfg) = self.config.types.get(type_name) {
                    requested = type_cfg.tools.clone();
                }
            }
        }
        for tool in &requested {
            if !WORKER_TOOL_ALLOWLIST.contains(&tool.as_str()) {
                return Err(WorkerError::ToolNotAllowed(tool.clone()));
            }
        }
        Ok(requested)
    }

    fn resolve_timeout(&self, params: &WorkerDispatchParams) -> u64 {
        if let Some(t) = params.timeout_seconds {
            return t;
        }
        if let Some(type_name) = &params.worker_type {
            if let Some(WorkerTypeConfig { timeout_seconds: Some(t), .. }) = self.config.types.get(type_name) {
                return *t;
            }
        }
        DEFAULT_TIMEOUT_SECS
    }

    /// `worker_dispatch`: validates, registers, writes the initial files,
    /// and spawns the worker's task. Returns as soon as the entry is
    /// registered -- it must not wait for the worker to produce output.
    pub async fn dispatch(
        &self,
        params: WorkerDispatchParams,
        primary_model: &str,
        fallback_models: &[String],
        allowed_tools: ToolRegistry,
    ) -> Result<WorkerDispatchResult, WorkerError> {
        if self.is_worker_context {
            return Err(WorkerError::NestedDispatch);
        }
        let running = self.registry.running_count();
        if running >= self.config.max_concurrent {
            return Err(WorkerError::ConcurrencyLimit(self.config.max_concurrent));
        }

        let requested_tools = self.resolve_tools(&params)?;
        let model = self
            .resolve_model(&params, primary_model, fallback_models)
            .ok_or(WorkerError::ModelUnresolved)?;
        let timeout_secs = self.resolve_timeout(&params);

        let id = Uuid::new_v4();
        let worker_dir = self.worker_dir(id);
        tokio::fs::create_dir_all(&worker_dir).await?;
        tokio::fs::write(worker_dir.join("task.md"), &params.task).await?;

        let result_path = worker_dir.join("result.md").to_string_lossy().to_string();
        let abort = CancellationToken::new();
        let entry = WorkerEntry {
            id,
            user_id: self.user_id.clone(),
            status: WorkerStatus::Running,
            task: params.task.clone(),
            model: model.clone(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            error: None,
            result_path: result_path.clone(),
            abort: abort.clone(),
        };
        let status_file = entry.to_status_file();
        self.registry.register(entry);
        write_status(&worker_dir, &status_file).await?;

        let worker_tools = build_worker_tools(&worker_dir, &requested_tools, allowed_tools);
        let registry = self.registry.clone();
        let llm = self.llm.clone();
        let fact_sink = self.fact_sink.clone();
        let task_text = params.task.clone();
        let dir = worker_dir.clone();

        tokio::spawn(async move {
            run_worker(
                id, task_text, model, timeout_secs, worker_tools, llm, registry.clone(), fact_sink, dir, abort,
            )
            .await;
            let registry_for_eviction = registry;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(EVICT_AFTER_HOURS as u64 * 3600)).await;
                registry_for_eviction.remove(id);
            });
        });

        Ok(WorkerDispatchResult {
            worker_id: id,
            status: WorkerStatus::Running,
            result_path,
            trigger_hint: trigger_hint(id),
        })
    }

    pub async fn check(&self, worker_id: Uuid) -> Result<StatusFile, WorkerError> {
        if let Some(status) = self.registry.with_entry(worker_id, |e| e.to_status_file()) {
            return Ok(status);
        }
        let path = self.worker_dir(worker_id).join("status.json");
        match crate::fsutil::read_json::<StatusFile>(&path).await? {
            Some(status) => Ok(status),
            None => Err(WorkerError::NotFound(worker_id)),
        }
    }

    /// Sets terminal status BEFORE invoking abort, so `run_worker`'s own
    /// completion path sees the entry already terminal and doesn't overwrite
    /// it or double-insert a fact -- this call is the sole place a
    /// cancellation fact gets recorded.
    pub async fn interrupt(&self, worker_id: Uuid) -> Result<StatusFile, WorkerError> {
        let snapshot = self
            .registry
            .with_entry(worker_id, |e| (e.status, e.abort.clone()))
            .ok_or(WorkerError::NotFound(worker_id))?;
        let (status, abort) = snapshot;
        if status.is_terminal() {
            return self.check(worker_id).await;
        }
        self.registry.update(worker_id, |e| {
            e.status = WorkerStatus::Cancelled;
            e.completed_at = Some(chrono::Utc::now());
        });
        let status_file = self
            .registry
            .with_entry(worker_id, |e| e.to_status_file())
            .ok_or(WorkerError::NotFound(worker_id))?;
        write_status(&self.worker_dir(worker_id), &status_file).await?;
        abort.cancel();
        if let Err(err) = self.fact_sink.record(&format!("worker {worker_id} cancelled")).await {
            warn!(worker_id = %worker_id, error = %err, "failed to record worker cancellation fact");
        }
        Ok(status_file)
    }

    pub async fn steer(&self, worker_id: Uuid, guidance: &str) -> Result<(), WorkerError> {
        let terminal = self
            .registry
            .with_entry(worker_id, |e| e.status.is_terminal())
            .ok_or(WorkerError::NotFound(worker_id))?;
        if terminal {
            return Ok(());
        }
        tokio::fs::write(self.worker_dir(worker_id).join("steering.md"), guidance).await?;
        Ok(())
    }
}

async fn write_status(worker_dir: &Path, status: &StatusFile) -> Result<(), WorkerError> {
    crate::fsutil::write_json_atomic(&worker_dir.join("status.json"), status).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(name = "worker_run", skip_all, fields(worker_id = %id))]
async fn run_worker(
    id: Uuid,
    task: String,
    model: String,
    timeout_secs: u64,
    tools: ToolRegistry,
    llm: Arc<LlmClient>,
    registry: Arc<WorkerRegistry>,
    fact_sink: Arc<dyn FactSink>,
    worker_dir: PathBuf,
    abort: CancellationToken,
) {
    let system_prompt = format!(
        "You are a worker agent. Your task:\n\n{task}\n\nYour working directory is {}.\n\
         Before every third tool call, re-read steering.md in your working directory if it exists --\n\
         it may contain updated guidance from the requester. Use only the tools you were given.\n\
         When finished, write your findings to result.md and stop calling tools.",
        worker_dir.display()
    );

    let timeout = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs));
    tokio::pin!(timeout);

    let work = run_tool_loop(&system_prompt, &model, &tools, &llm, &worker_dir, &abort);
    tokio::pin!(work);

    let outcome = tokio::select! {
        _ = &mut timeout => WorkerOutcome::Timeout,
        _ = abort.cancelled() => WorkerOutcome::Cancelled,
        result = &mut work => match result {
            Ok(summary) => WorkerOutcome::Complete(summary),
            Err(e) => WorkerOutcome::Failed(e.to_string()),
        },
    };

    // If the entry already flipped to a terminal state (timeout fired the
    // handle, or worker_interrupt raced us), don't overwrite it.
    let already_terminal = registry
        .with_entry(id, |e| e.status.is_terminal())
        .unwrap_or(true);

    let result_path = worker_dir.join("result.md").to_string_lossy().to_string();
    if !already_terminal {
        let (status, error, fact) = match &outcome {
            WorkerOutcome::Complete(_) => (
                WorkerStatus::Complete,
                None,
                format!("{}, results at {result_path}", trigger_hint(id)),
            ),
            WorkerOutcome::Timeout => (
                WorkerStatus::Timeout,
                Some("worker timed out".to_string()),
                format!("worker {id} timed out"),
            ),
            WorkerOutcome::Cancelled => (WorkerStatus::Cancelled, None, format!("worker {id} cancelled")),
            WorkerOutcome::Failed(e) => (
                WorkerStatus::Failed,
                Some(e.clone()),
                format!("worker {id} failed: {e}"),
            ),
        };
        registry.update(id, |e| {
            e.status = status;
            e.completed_at = Some(chrono::Utc::now());
            e.error = error;
        });
        if let Some(status_file) = registry.with_entry(id, |e| e.to_status_file()) {
            if let Err(err) = write_status(&worker_dir, &status_file).await {
                warn!(worker_id = %id, error = %err, "failed to write worker status file");
            }
        }
        if let Err(err) = fact_sink.record(&fact).await {
            warn!(worker_id = %id, error = %err, "failed to record worker completion fact");
        }
    }
    info!(worker_id = %id, "worker finished");
}

enum WorkerOutcome {
    Complete(String),
    Timeout,
    Cancelled,
}

async fn run_tool_loop(
    system_prompt: &str,
    model: &str,
    tools: &ToolRegistry,
    llm: &LlmClient,
    worker_dir: &Path,
    abort: &CancellationToken,
) -> anyhow::Result<String> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    let tool_defs = tools.definitions();

    for _ in 0..MAX_TOOL_TURNS {
        if abort.is_cancelled() {
            anyhow::bail!("worker cancelled");
        }
        let mut request = ChatRequest::new(model.to_string(), messages.clone());
        if !tool_defs.is_empty() {
            request = request.with_tools(tool_defs.clone());
        }
        let response = llm.chat(&request).await?;
        let Some(choice) = response.choices.into_iter().next() else {
            anyhow::bail!("model returned no choices");
        };
        if choice.finish_reason.as_deref() == Some("error") {
            anyhow::bail!("model reported stopReason=error");
        }
        let message = choice.message;
        match &message.tool_calls {
            Some(calls) if !calls.is_empty() => {
                messages.push(message.clone());
                for call in calls {
                    let tool = tools.get(&call.function.name);
                    let output = match tool {
                        Some(tool) => tool
                            .call(&call.function.arguments)
                            .await
                            .unwrap_or_else(|e| format!("tool error: {e}")),
                        None => format!("unknown tool: {}", call.function.name),
                    };
                    messages.push(ChatMessage::tool_result(call.id.clone(), output));
                }
            }
            _ => return Ok(message.content),
        }
    }
    let result_path = worker_dir.join("result.md");
    let fallback = "worker exhausted its tool-call budget without finishing".to_string();
    let _ = tokio::fs::write(&result_path, &fallback).await;
    Ok(fallback)
}

fn build_worker_tools(worker_dir: &Path, requested: &[String], source: ToolRegistry) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for name in requested {
        if let Some(tool) = source.get(name) {
            registry.register(tool);
        }
    }
    registry.register(Arc::new(ScopedReadFile { dir: worker_dir.to_path_buf() }));
    registry.register(Arc::new(ScopedWriteFile { dir: worker_dir.to_path_buf() }));
    registry
}

fn validate_filename(name: &str) -> anyhow::Result<()> {
    if name.len() > 255 {
        anyhow::bail!("filename too long");
    }
    if name.contains('/') || name.contains('\\') {
        anyhow::bail!("filename must not contain a path separator");
    }
    if name.starts_with('.') {
        anyhow::bail!("filename must not start with '.'");
    }
    if RESERVED_FILENAMES.contains(&name) {
        anyhow::bail!("'{name}' is reserved");
    }
    Ok(())
}

struct ScopedReadFile {
    dir: PathBuf,
}

#[async_trait::async_trait]
impl Tool for ScopedReadFile {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a file from this worker's working directory."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "filename": { "type": "string" } },
            "required": ["filename"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let parsed: serde_json::Value = serde_json::from_str(args)?;
        let filename = parsed
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'filename'"))?;
        validate_filename(filename)?;
        Ok(tokio::fs::read_to_string(self.dir.join(filename)).await?)
    }
}

struct ScopedWriteFile {
    dir: PathBuf,
}

#[async_trait::async_trait]
impl Tool for ScopedWriteFile {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write a file into this worker's working directory, overwriting it if present."
    }
    fn capability(&self) -> Capability {
        Capability::Safe
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filename": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["filename", "content"]
        })
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let parsed: serde_json::Value = serde_json::from_str(args)?;
        let filename = parsed
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'filename'"))?;
        let content = parsed
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'content'"))?;
        validate_filename(filename)?;
        if content.len() as u64 > MAX_WORKER_FILE_BYTES {
            anyhow::bail!("file exceeds {MAX_WORKER_FILE_BYTES} byte limit");
        }
        tokio::fs::write(self.dir.join(filename), content).await?;
        Ok(format!("wrote {} bytes to {filename}", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FactSink;
    use std::collections::HashMap;

    struct NullFactSink;
    #[async_trait::async_trait]
    impl FactSink for NullFactSink {
        async fn record(&self, _content: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn runtime_with(config: WorkersConfig) -> WorkerRuntime {
        WorkerRuntime::new(
            Arc::new(WorkerRegistry::new()),
            Arc::new(crate::llm::resolve_model("openai/gpt-4o-mini").unwrap()),
            Arc::new(NullFactSink),
            PathBuf::from("/tmp/mylm-test"),
            config,
            "u1",
        )
    }

    #[test]
    fn validate_filename_rejects_path_traversal_and_reserved_names() {
        assert!(validate_filename("notes.md").is_ok());
        assert!(validate_filename("../secret").is_err());
        assert!(validate_filename("sub/dir.txt").is_err());
        assert!(validate_filename(".hidden").is_err());
        assert!(validate_filename("status.json").is_err());
    }

    #[test]
    fn resolve_tools_rejects_anything_outside_the_allowlist() {
        let runtime = runtime_with(WorkersConfig::default());
        let params = WorkerDispatchParams { tools: vec!["rm_rf".to_string()], ..WorkerDispatchParams::default() };
        assert!(matches!(runtime.resolve_tools(&params), Err(WorkerError::ToolNotAllowed(_))));
    }

    #[test]
    fn resolve_model_prefers_explicit_param_then_worker_type_then_config_then_fallback_then_primary() {
        let mut types = HashMap::new();
        types.insert(
            "researcher".to_string(),
            WorkerTypeConfig { model: Some("anthropic/claude-haiku".to_string()), tools: Vec::new(), timeout_seconds: None },
        );
        let runtime = runtime_with(WorkersConfig { max_concurrent: 3, model: Some("openai/gpt-4o".to_string()), types });
        let fallbacks = vec!["openai/gpt-4o-mini".to_string()];

        let explicit = WorkerDispatchParams { model: Some("openai/o3".to_string()), ..WorkerDispatchParams::default() };
        assert_eq!(runtime.resolve_model(&explicit, "primary/model", &fallbacks), Some("openai/o3".to_string()));

        let by_type = WorkerDispatchParams { worker_type: Some("researcher".to_string()), ..WorkerDispatchParams::default() };
        assert_eq!(runtime.resolve_model(&by_type, "primary/model", &fallbacks), Some("anthropic/claude-haiku".to_string()));

        let by_config = WorkerDispatchParams::default();
        assert_eq!(runtime.resolve_model(&by_config, "primary/model", &fallbacks), Some("openai/gpt-4o".to_string()));

        let no_config = runtime_with(WorkersConfig { max_concurrent: 3, model: None, types: HashMap::new() });
        assert_eq!(
            no_config.resolve_model(&WorkerDispatchParams::default(), "primary/model", &fallbacks),
            Some("openai/gpt-4o-mini".to_string())
        );
        assert_eq!(
            no_config.resolve_model(&WorkerDispatchParams::default(), "primary/model", &[]),
            Some("primary/model".to_string())
        );
    }

    #[test]
    fn resolve_timeout_falls_back_to_the_default() {
        let runtime = runtime_with(WorkersConfig::default());
        assert_eq!(runtime.resolve_timeout(&WorkerDispatchParams::default()), DEFAULT_TIMEOUT_SECS);
        let explicit = WorkerDispatchParams { timeout_seconds: Some(30), ..WorkerDispatchParams::default() };
        assert_eq!(runtime.resolve_timeout(&explicit), 30);
    }

    #[tokio::test]
    async fn dispatch_rejects_from_inside_a_worker_context() {
        let runtime = runtime_with(WorkersConfig::default()).as_worker_context();
        let result = runtime
            .dispatch(WorkerDispatchParams::default(), "primary/model", &[], ToolRegistry::new())
            .await;
        assert!(matches!(result, Err(WorkerError::NestedDispatch)));
    }
}
