//! Owns the per-user cached session: the opaque transcript, system-prompt
//! rendering, the tool-calling loop, model-fallback prompting, and
//! idle/nightly auto-compaction.

pub mod compaction;
mod error;
pub mod prompt;
pub mod repair;
pub mod store;

pub use error::SessionError;
pub use prompt::{default_renderer, PromptContext, PromptRenderer};
pub use store::{FileSessionStore, SessionStore, StoredSession};

use crate::approval::{ApprovalGate, ApprovalVerdict};
use crate::llm::chat::{ChatMessage, ChatRequest, ToolCall, ToolDefinition};
use crate::llm::{resolve_model, LlmClient};
use crate::tool::ToolRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// A fallback's default context window when the resolved client's own
/// config doesn't know better -- matches `LlmConfig::new`'s default.
const DEFAULT_MAX_CONTEXT_TOKENS: usize = 32_768;

/// One user's live, cached transcript plus the bookkeeping the manager needs
/// to decide when to compact.
pub struct Session {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub last_user_message_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(model: String) -> Self {
        Self { messages: Vec::new(), model, last_user_message_at: None }
    }
}

/// Everything a single turn needs besides the cached transcript: the tool
/// set, the approval gate, and the freshly-rendered system prompt.
pub struct TurnContext<'a> {
    pub tools: &'a ToolRegistry,
    pub approval: &'a ApprovalGate,
    pub system_prompt: String,
    /// Optional sink for the per-call tool audit trail; `None` in tests that
    /// don't care about it.
    pub audit: Option<&'a crate::audit::AuditLog>,
}

/// What a completed turn produced, plus the telemetry the dispatcher
/// appends to the usage log.
pub struct TurnOutcome {
    pub reply: String,
    pub model: String,
    pub usage: Option<crate::llm::chat::Usage>,
    pub latency_ms: u64,
}

/// Caches one [`Session`] per user, single-flight on load, and prompts
/// through a fallback chain of `provider/model` strings, reconstructing an
/// [`LlmClient`] per model since the client always sends its own configured
/// model rather than whatever the request asks for.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    clients: DashMap<String, Arc<LlmClient>>,
    renderer: PromptRenderer,
    models: Vec<String>,
    max_tool_turns: usize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, primary_model: String, fallback_models: Vec<String>) -> Self {
        let mut models = vec![primary_model];
        models.extend(fallback_models);
        Self {
            store,
            sessions: DashMap::new(),
            clients: DashMap::new(),
            renderer: default_renderer(),
            models,
            max_tool_turns: 8,
        }
    }

    pub fn with_renderer(mut self, renderer: PromptRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_max_tool_turns(mut self, max: usize) -> Self {
        self.max_tool_turns = max;
        self
    }

    pub fn render_prompt(&self, ctx: &PromptContext) -> String {
        (self.renderer)(ctx)
    }

    /// Single-flight `getOrLoad`: a `DashMap::entry` call only lets one
    /// caller actually win the insert race; every other concurrent caller
    /// for the same user gets the same handle and then blocks on its
    /// `Mutex` until the winner's load finishes, instead of re-reading disk.
    pub async fn get_or_load(&self, user_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        if let Some(existing) = self.sessions.get(user_id) {
            return Ok(existing.clone());
        }
        let placeholder = Arc::new(Mutex::new(Session::new(self.models[0].clone())));
        let handle = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| placeholder.clone())
            .clone();

        if Arc::ptr_eq(&handle, &placeholder) {
            let mut guard = handle.lock().await;
            match self.store.load(user_id).await {
                Ok(Some(stored)) => {
                    guard.messages = repair::repair(stored.messages);
                    guard.model = stored.model;
                }
                Ok(None) => {}
                Err(source) => {
                    drop(guard);
                    self.store.quarantine(user_id).await.ok();
                    self.sessions.remove(user_id);
                    return Err(SessionError::LoadFailed { user_id: user_id.to_string(), source });
                }
            }
        }
        Ok(handle)
    }

    /// `/clear`: evicts the cached session and deletes its persisted
    /// transcript.
    pub async fn clear(&self, user_id: &str) -> Result<(), SessionError> {
        self.sessions.remove(user_id);
        self.store.delete(user_id).await.map_err(|source| SessionError::LoadFailed { user_id: user_id.to_string(), source })?;
        Ok(())
    }

    /// Drops the cached handle without touching the persisted transcript
    /// (process shutdown, not `/clear`).
    pub fn evict(&self, user_id: &str) {
        self.sessions.remove(user_id);
    }

    fn client_for(&self, model: &str) -> anyhow::Result<Arc<LlmClient>> {
        if let Some(client) = self.clients.get(model) {
            return Ok(client.clone());
        }
        let client = Arc::new(resolve_model(model)?);
        self.clients.insert(model.to_string(), client.clone());
        Ok(client)
    }

    /// Runs a full tool-calling turn: pushes `user_text`, prompts with
    /// fallback, executes any requested tools (gated by `ctx.approval`), and
    /// loops until the model returns plain content or the tool-turn budget
    /// is exhausted. Persists the transcript on success; a save failure is
    /// logged, not propagated, so a storage hiccup never costs the user
    /// their reply.
    ///
    /// `is_real_user_message` gates `last_user_message_at`: synthetic
    /// messages (scheduler ticks, worker-trigger activations, approval
    /// replies) must not reset the idle-compaction clock, or a background
    /// job firing on its own schedule would make the session look
    /// perpetually active.
    pub async fn turn(
        &self,
        user_id: &str,
        user_text: &str,
        is_real_user_message: bool,
        ctx: TurnContext<'_>,
    ) -> Result<TurnOutcome, SessionError> {
        let started = std::time::Instant::now();
        let handle = self.get_or_load(user_id).await?;
        let mut session = handle.lock().await;
        session.messages.push(ChatMessage::user(user_text));
        if is_real_user_message {
            session.last_user_message_at = Some(Utc::now());
        }

        let tool_defs = ctx.tools.definitions();
        let mut reply = String::new();
        let mut usage = None;
        let mut model = session.model.clone();
        for _ in 0..self.max_tool_turns {
            let mut request_messages = vec![ChatMessage::system(ctx.system_prompt.clone())];
            request_messages.extend(session.messages.clone());

            let (response, won_model) = self.prompt_with_fallback(request_messages, &tool_defs).await?;
            session.model = won_model.clone();
            model = won_model;
            usage = response.usage.clone();

            let Some(choice) = response.choices.into_iter().next() else {
                reply = String::new();
                break;
            };
            let message = choice.message;
            match &message.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    session.messages.push(message.clone());
                    for call in calls {
                        let output = self.execute_tool(user_id, call, ctx.tools, ctx.approval, ctx.audit).await;
                        session.messages.push(ChatMessage::tool_result(call.id.clone(), output));
                    }
                }
                _ => {
                    reply = message.content;
                    break;
                }
            }
        }

        let stored = StoredSession { messages: session.messages.clone(), model: session.model.clone() };
        drop(session);
        if let Err(err) = self.store.save(user_id, &stored).await {
            warn!(%user_id, error = %err, "failed to persist session after turn");
        }
        Ok(TurnOutcome { reply, model, usage, latency_ms: started.elapsed().as_millis() as u64 })
    }

    async fn execute_tool(
        &self,
        user_id: &str,
        call: &ToolCall,
        tools: &ToolRegistry,
        approval: &ApprovalGate,
        audit: Option<&crate::audit::AuditLog>,
    ) -> String {
        let Some(tool) = tools.get(&call.function.name) else {
            return format!("unknown tool: {}", call.function.name);
        };
        if approval.check(user_id, tool.name(), tool.capability()) == ApprovalVerdict::PendingApproval {
            return format!(
                "tool '{}' requires approval before it can run -- reply yes/no/always to continue",
                tool.name()
            );
        }
        let started = std::time::Instant::now();
        let result = tool.call(&call.function.arguments).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let (output, result_kind) = match result {
            Ok(output) => (output, "ok"),
            Err(e) => (format!("tool error: {e}"), "error"),
        };
        if let Some(audit) = audit {
            if let Err(e) = audit
                .append_tool_call(user_id, tool.name(), &call.function.arguments, result_kind, latency_ms)
                .await
            {
                warn!(%user_id, tool = tool.name(), error = %e, "failed to append tool-call audit entry");
            }
        }
        output
    }

    /// Tries each model in the configured chain in order, rebuilding a
    /// client per model since [`LlmClient::chat`] always sends its own
    /// configured model. Returns the response plus whichever model spec
    /// actually answered, so the caller can remember it.
    async fn prompt_with_fallback(
        &self,
        messages: Vec<ChatMessage>,
        tool_defs: &[ToolDefinition],
    ) -> Result<(crate::llm::ChatResponse, String), SessionError> {
        let mut last_err: Option<anyhow::Error> = None;
        for model in &self.models {
            let client = match self.client_for(model) {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let mut request = ChatRequest::new(model.clone(), messages.clone());
            if !tool_defs.is_empty() {
                request = request.with_tools(tool_defs.to_vec());
            }
            match client.chat(&request).await {
                Ok(response) => {
                    let stopped_with_error = response
                        .choices
                        .first()
                        .and_then(|c| c.finish_reason.as_deref())
                        == Some("error");
                    if stopped_with_error {
                        warn!(model = %model, "model reported stopReason=error, trying next model in fallback chain");
                        last_err = Some(anyhow::anyhow!("model {model} reported stopReason=error"));
                        continue;
                    }
                    return Ok((response, model.clone()));
                }
                Err(e) => {
                    warn!(model = %model, error = %e, "prompt failed, trying next model in fallback chain");
                    last_err = Some(e);
                }
            }
        }
        Err(SessionError::PromptFailed(last_err.unwrap_or_else(|| anyhow::anyhow!("no models configured"))))
    }

    /// Idle pass (every 10 min per spec): compacts any cached session whose
    /// last user message is old enough and whose context usage has crossed
    /// the threshold.
    pub async fn idle_compact_pass(&self) {
        let now = Utc::now();
        let handles: Vec<(String, Arc<Mutex<Session>>)> =
            self.sessions.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        for (user_id, handle) in handles {
            self.compact_one(&user_id, &handle, now, false).await;
        }
    }

    /// Nightly pass (03:00 local, per spec): compacts every cached session
    /// unconditionally.
    pub async fn nightly_compact_pass(&self) {
        let now = Utc::now();
        let handles: Vec<(String, Arc<Mutex<Session>>)> =
            self.sessions.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        for (user_id, handle) in handles {
            self.compact_one(&user_id, &handle, now, true).await;
        }
    }

    async fn compact_one(&self, user_id: &str, handle: &Arc<Mutex<Session>>, now: DateTime<Utc>, nightly: bool) {
        let mut session = handle.lock().await;
        if session.messages.is_empty() {
            return;
        }
        let max_context_tokens = self
            .client_for(&session.model)
            .map(|c| c.config().max_context_tokens)
            .unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS);
        if !nightly
            && !compaction::should_idle_compact(session.last_user_message_at, &session.messages, max_context_tokens, now)
        {
            return;
        }
        let client = match self.client_for(&session.model) {
            Ok(c) => c,
            Err(e) => {
                warn!(%user_id, error = %e, "compaction skipped: could not resolve client");
                return;
            }
        };
        match compaction::compact(&client, &session.model, &session.messages, nightly).await {
            Ok(summary) => {
                session.messages = summary;
                let stored = StoredSession { messages: session.messages.clone(), model: session.model.clone() };
                drop(session);
                if let Err(e) = self.store.save(user_id, &stored).await {
                    warn!(%user_id, error = %e, "failed to persist compacted session");
                }
            }
            Err(e) => warn!(%user_id, error = %e, "compaction pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemStore {
        saved: parking_lot::Mutex<std::collections::HashMap<String, StoredSession>>,
    }

    #[async_trait]
    impl SessionStore for MemStore {
        async fn load(&self, user_id: &str) -> anyhow::Result<Option<StoredSession>> {
            Ok(self.saved.lock().get(user_id).cloned())
        }
        async fn save(&self, user_id: &str, session: &StoredSession) -> anyhow::Result<()> {
            self.saved.lock().insert(user_id.to_string(), session.clone());
            Ok(())
        }
        async fn quarantine(&self, _user_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete(&self, user_id: &str) -> anyhow::Result<()> {
            self.saved.lock().remove(user_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn get_or_load_is_single_flight_per_user() {
        let store = Arc::new(MemStore::default());
        let manager = Arc::new(SessionManager::new(store, "openai/gpt-4o-mini".to_string(), vec![]));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let handle = manager.get_or_load("u1").await.unwrap();
                calls.fetch_add(1, Ordering::SeqCst);
                handle
            }));
        }
        let mut resolved = Vec::new();
        for h in handles {
            resolved.push(h.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        for w in resolved.windows(2) {
            assert!(Arc::ptr_eq(&w[0], &w[1]));
        }
    }

    #[tokio::test]
    async fn clear_evicts_cache_and_deletes_store() {
        let store = Arc::new(MemStore::default());
        store.save("u1", &StoredSession { messages: vec![ChatMessage::user("hi")], model: "openai/gpt-4o-mini".into() }).await.unwrap();
        let manager = SessionManager::new(store.clone(), "openai/gpt-4o-mini".to_string(), vec![]);

        let handle = manager.get_or_load("u1").await.unwrap();
        assert_eq!(handle.lock().await.messages.len(), 1);

        manager.clear("u1").await.unwrap();
        assert!(store.saved.lock().get("u1").is_none());
        assert!(manager.sessions.get("u1").is_none());
    }
}
