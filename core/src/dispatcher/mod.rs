//! Glues the queue, session manager, projection store, worker runtime, and
//! scheduler together. One [`Dispatcher`] per process; it is both the
//! [`MessageProcessor`](crate::queue::MessageProcessor) the queue drains
//! into and the [`RejectHandler`](crate::queue::RejectHandler) it calls back
//! on backpressure.
//!
//! Grounded on the teacher's command-vs-chat branching in
//! `src/tui/app/commands.rs` / `core/src/agent/session/input/chat.rs` (meta
//! commands are intercepted before the LLM is ever invoked) and on
//! `core/src/config/manager.rs`'s append-only rate-limit accounting for the
//! usage-telemetry pattern below.

mod error;
mod fact_sink;
mod user_runtime;

pub use error::DispatchError;
pub use fact_sink::TriggeringFactSink;
pub use user_runtime::UserRuntime;

use crate::approval::ApprovalGate;
use crate::audit::AuditLog;
use crate::bridge::BridgeRegistry;
use crate::builtin_tools::{FetchUrlTool, WebSearchTool};
use crate::config::{AgentConfig, Config, PrimaryUserConfig, WorkersConfig};
use crate::crash_recovery::{CrashRecovery, PendingCheckpoint, RestartMarker};
use crate::llm::resolve_model;
use crate::queue::{Message, MessageProcessor, MessageQueue, RejectHandler, RejectReason};
use crate::scheduler::SchedulerDaemon;
use crate::session::{PromptContext, SessionManager, TurnContext};
use crate::tool::ToolRegistry;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tracing::{error, warn};

const MAX_TEXT_LEN: usize = 10_000;
const RECENT_TOOL_CALLS_SHOWN: usize = 20;

/// What the agent emits in place of real content when it decides a
/// scheduler-invoked turn has nothing worth saying.
pub const SILENT_REPLY_SENTINEL: &str = "__MYLM_SILENT__";

const HELP_TEXT: &str = "Commands: /start, /help, /clear, /memory, /log, /restart. Anything else is a message to the agent.";
const START_TEXT: &str = "Ready. Send a message to begin, or /help for commands.";

/// Sent out once a user's restart request has been accepted, before the
/// process actually exits.
pub struct RestartRequest {
    pub marker: RestartMarker,
}

pub struct Dispatcher {
    data_dir: PathBuf,
    agent: AgentConfig,
    workers_config: WorkersConfig,
    primary_user: PrimaryUserConfig,
    sessions: SessionManager,
    approval: Arc<ApprovalGate>,
    audit: Arc<AuditLog>,
    crash_recovery: Arc<CrashRecovery>,
    bridges: Arc<BridgeRegistry>,
    user_runtimes: DashMap<String, Arc<UserRuntime>>,
    recovered_users: DashSet<String>,
    queue: Arc<OnceCell<Arc<MessageQueue>>>,
    scheduler: Arc<OnceCell<Arc<SchedulerDaemon>>>,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
}

impl Dispatcher {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        config: &Config,
        bridges: Arc<BridgeRegistry>,
        restart_tx: mpsc::UnboundedSender<RestartRequest>,
    ) -> Self {
        let data_dir = data_dir.into();
        let sessions_store = Arc::new(crate::session::FileSessionStore::new(data_dir.join("sessions")));
        let sessions = SessionManager::new(sessions_store, config.agent.model.clone(), config.agent.fallback_models.clone());
        let approval = Arc::new(ApprovalGate::new());
        approval.preapprove(&config.primary_user.user_id, &config.trust.approved_tools);

        Self {
            agent: config.agent.clone(),
            workers_config: config.tools.workers.clone(),
            primary_user: config.primary_user.clone(),
            sessions,
            approval,
            audit: Arc::new(AuditLog::new(data_dir.clone())),
            crash_recovery: Arc::new(CrashRecovery::new(data_dir.clone())),
            bridges,
            user_runtimes: DashMap::new(),
            recovered_users: DashSet::new(),
            queue: Arc::new(OnceCell::new()),
            scheduler: Arc::new(OnceCell::new()),
            restart_tx,
            data_dir,
        }
    }

    /// Breaks the `Dispatcher`/`MessageQueue` construction cycle: the queue
    /// needs `self` (as processor and reject handler) to build, so it can
    /// only be attached once built. A [`TriggeringFactSink`] created before
    /// this is called simply drops any activation it sees.
    pub fn attach_queue(&self, queue: Arc<MessageQueue>) {
        let _ = self.queue.set(queue);
    }

    pub fn attach_scheduler(&self, scheduler: Arc<SchedulerDaemon>) {
        let _ = self.scheduler.set(scheduler);
    }

    pub fn approval(&self) -> &Arc<ApprovalGate> {
        &self.approval
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn crash_recovery(&self) -> &Arc<CrashRecovery> {
        &self.crash_recovery
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Opens (or returns the cached) runtime for the configured primary
    /// user. Used by the binary at startup to obtain the projection store
    /// the scheduler's maintenance jobs run against, before the scheduler
    /// itself exists to be attached back via [`attach_scheduler`].
    pub async fn primary_user_runtime(&self) -> anyhow::Result<Arc<UserRuntime>> {
        let primary = self.primary_user.clone();
        self.user_runtime(&primary.user_id, &primary.channel_id, &primary.platform).await
    }

    /// Lazily opens (and caches) the per-user working set: projection
    /// store, archival memory, and worker runtime.
    async fn user_runtime(&self, user_id: &str, channel_id: &str, platform: &str) -> anyhow::Result<Arc<UserRuntime>> {
        if let Some(existing) = self.user_runtimes.get(user_id) {
            return Ok(existing.clone());
        }
        if let Err(e) = self.approval.load_persisted(&self.data_dir, user_id).await {
            warn!(user_id, error = %e, "failed to load persisted trust store");
        }
        let model = self
            .workers_config
            .model
            .clone()
            .unwrap_or_else(|| self.agent.model.clone());
        let workers_llm = Arc::new(resolve_model(&model)?);
        let runtime = Arc::new(
            UserRuntime::open(
                &self.data_dir,
                user_id,
                channel_id,
                platform,
                workers_llm,
                self.workers_config.clone(),
                self.queue.clone(),
            )
            .await?,
        );
        self.user_runtimes.insert(user_id.to_string(), runtime.clone());
        Ok(runtime)
    }

    fn build_tools(&self, runtime: &UserRuntime, user_id: &str, channel_id: &str, platform: &str) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FetchUrlTool::new()));
        tools.register(Arc::new(WebSearchTool::new()));

        let worker_tools = {
            let mut wt = ToolRegistry::new();
            wt.register(Arc::new(FetchUrlTool::new()));
            wt.register(Arc::new(WebSearchTool::new()));
            wt
        };
        tools.register(Arc::new(crate::workers::WorkerDispatchTool {
            runtime: runtime.workers.clone(),
            primary_model: self.agent.model.clone(),
            fallback_models: self.agent.fallback_models.clone(),
            worker_tools,
        }));
        tools.register(Arc::new(crate::workers::WorkerCheckTool { runtime: runtime.workers.clone() }));
        tools.register(Arc::new(crate::workers::WorkerInterruptTool { runtime: runtime.workers.clone() }));
        tools.register(Arc::new(crate::workers::WorkerSteerTool { runtime: runtime.workers.clone() }));

        if let Some(scheduler) = self.scheduler.get() {
            tools.register(Arc::new(crate::scheduler::tools::ScheduleCreateTool {
                daemon: scheduler.clone(),
                user_id: user_id.to_string(),
                channel_id: channel_id.to_string(),
                platform: platform.to_string(),
                timezone: self.agent.timezone.clone(),
            }));
            tools.register(Arc::new(crate::scheduler::tools::ScheduleListTool { daemon: scheduler.clone(), user_id: user_id.to_string() }));
            tools.register(Arc::new(crate::scheduler::tools::ScheduleDeleteTool { daemon: scheduler.clone() }));
        }
        tools
    }

    /// Entry point the queue's drain task and the scheduler both funnel
    /// into.
    #[tracing::instrument(name = "dispatch_message", skip_all, fields(channel_id = %message.channel_id, user_id = %message.user_id))]
    pub async fn process_message(&self, message: Message) -> anyhow::Result<()> {
        let user_id = message.user_id.clone();
        let channel_id = message.channel_id.clone();
        let platform = message.platform.clone();
        let text = message.text.trim();

        if !message.is_synthetic() {
            if self.recovered_users.remove(&user_id).is_some() {
                self.notify(&platform, &channel_id, "Your previous session was unreadable and has been reset.").await;
            }
            if let Some(command_reply) = self.handle_command(&user_id, text).await {
                self.notify(&platform, &channel_id, &command_reply).await;
                return Ok(());
            }
            if text.len() > MAX_TEXT_LEN {
                self.notify(&platform, &channel_id, "That message is too long (10,000 character limit).").await;
                return Ok(());
            }
            if self.approval.resolve_from_text(&user_id, text) {
                self.approval.persist(&self.data_dir, &user_id).await.ok();
            }
        }

        let runtime = match self.user_runtime(&user_id, &channel_id, &platform).await {
            Ok(r) => r,
            Err(e) => {
                error!(%user_id, error = %e, "failed to open user runtime");
                self.notify(&platform, &channel_id, "Something went wrong opening your workspace; please try again.").await;
                return Ok(());
            }
        };
        let tools = self.build_tools(&runtime, &user_id, &channel_id, &platform);

        if !message.is_synthetic() {
            let checkpoint = PendingCheckpoint {
                text: text.to_string(),
                channel_id: channel_id.clone(),
                platform: platform.clone(),
                timestamp: message.arrived_at,
            };
            if let Err(e) = self.crash_recovery.write_checkpoint(&user_id, &checkpoint).await {
                warn!(%user_id, error = %e, "failed to write crash-recovery checkpoint");
            }
            self.audit.append_conversation(&user_id, "user", text).await.ok();
        }

        let system_prompt = self.render_system_prompt(&runtime, &user_id, tools.names()).await;
        let ctx = TurnContext {
            tools: &tools,
            approval: &self.approval,
            system_prompt,
            audit: Some(self.audit.as_ref()),
        };
        let turn_result = self.sessions.turn(&user_id, text, !message.is_synthetic(), ctx).await;

        if !message.is_synthetic() {
            self.crash_recovery.delete_checkpoint(&user_id).await.ok();
        }

        match turn_result {
            Ok(outcome) => {
                self.record_usage(&user_id, &outcome).await;
                if outcome.reply.trim() != SILENT_REPLY_SENTINEL && !outcome.reply.trim().is_empty() {
                    self.audit.append_conversation(&user_id, "assistant", &outcome.reply).await.ok();
                    self.notify(&platform, &channel_id, &outcome.reply).await;
                }
                Ok(())
            }
            Err(crate::session::SessionError::LoadFailed { user_id: failed_user, source }) => {
                self.recovered_users.insert(failed_user.clone());
                warn!(user_id = %failed_user, error = %source, "session quarantined after load failure");
                Ok(())
            }
            Err(e) => {
                error!(%user_id, error = %e, "turn failed");
                self.notify(&platform, &channel_id, "Sorry, something went wrong processing that.").await;
                Ok(())
            }
        }
    }

    async fn render_system_prompt(&self, runtime: &UserRuntime, user_id: &str, tool_names: Vec<String>) -> String {
        if let Err(e) = runtime.projections.auto_expire(24).await {
            warn!(%user_id, error = %e, "auto_expire failed before rendering prompt");
        }
        let upcoming = runtime.projections.get_upcoming(7).await.unwrap_or_default();
        let core_memory = crate::memory::CoreMemoryStore::new(self.data_dir.clone()).get(user_id).await.unwrap_or_default();
        self.sessions.render_prompt(&PromptContext {
            static_prompt: self.agent.system_prompt.clone(),
            tool_names,
            core_memory,
            upcoming_projections: upcoming,
        })
    }

    async fn record_usage(&self, user_id: &str, outcome: &crate::session::TurnOutcome) {
        let Some(usage) = &outcome.usage else { return };
        let cost_usd = resolve_model(&outcome.model)
            .map(|client| {
                let cfg = client.config();
                (usage.prompt_tokens as f64 / 1000.0) * cfg.input_price_per_1k
                    + (usage.completion_tokens as f64 / 1000.0) * cfg.output_price_per_1k
            })
            .unwrap_or(0.0);
        if let Err(e) = self
            .audit
            .append_usage(user_id, &outcome.model, usage.prompt_tokens, usage.completion_tokens, outcome.latency_ms, cost_usd)
            .await
        {
            warn!(%user_id, error = %e, "failed to append usage record");
        }
    }

    async fn notify(&self, platform: &str, channel_id: &str, text: &str) {
        if let Err(e) = self.bridges.send(platform, channel_id, text).await {
            warn!(platform, channel_id, error = %e, "failed to deliver reply");
        }
    }

    /// Returns `Some(reply text)` if `text` was a recognized command
    /// (handled entirely here, no LLM involved); `None` otherwise.
    async fn handle_command(&self, user_id: &str, text: &str) -> Option<String> {
        match text {
            "/start" => Some(START_TEXT.to_string()),
            "/help" => Some(HELP_TEXT.to_string()),
            "/clear" => {
                if let Err(e) = self.sessions.clear(user_id).await {
                    warn!(%user_id, error = %e, "clear failed");
                    return Some("Could not clear your session.".to_string());
                }
                Some("Session cleared.".to_string())
            }
            "/memory" => {
                let store = crate::memory::CoreMemoryStore::new(self.data_dir.clone());
                let content = store.get(user_id).await.unwrap_or_default();
                Some(if content.is_empty() { "Nothing remembered yet.".to_string() } else { content })
            }
            "/log" => {
                let entries = self.audit.recent_tool_calls(user_id, RECENT_TOOL_CALLS_SHOWN).await.unwrap_or_default();
                if entries.is_empty() {
                    Some("No tool calls logged yet.".to_string())
                } else {
                    let rendered = entries
                        .iter()
                        .map(|e| format!("{} {} -> {} ({}ms)", e.timestamp.to_rfc3339(), e.tool_name, e.result_kind, e.latency_ms))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Some(rendered)
                }
            }
            "/restart" => {
                let marker = RestartMarker {
                    user_id: user_id.to_string(),
                    channel_id: self.primary_user.channel_id.clone(),
                    platform: self.primary_user.platform.clone(),
                    reason: "user requested".to_string(),
                };
                if let Err(e) = self.crash_recovery.write_restart_marker(&marker).await {
                    warn!(%user_id, error = %e, "failed to write restart marker");
                    return Some("Could not start a restart.".to_string());
                }
                let _ = self.restart_tx.send(RestartRequest { marker });
                Some("Restarting...".to_string())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl MessageProcessor for Dispatcher {
    async fn process(&self, message: Message) -> anyhow::Result<()> {
        self.process_message(message).await
    }
}

impl RejectHandler for Dispatcher {
    fn on_reject(&self, message: &Message, reason: RejectReason) {
        let text = match reason {
            RejectReason::QueueFull => "I'm a bit backed up right now -- please try again shortly.",
            RejectReason::RateLimited => "You're sending messages faster than I can keep up -- please slow down a little.",
        };
        let bridges = self.bridges.clone();
        let platform = message.platform.clone();
        let channel_id = message.channel_id.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = bridges.send(&platform, &channel_id, &text).await {
                warn!(platform, channel_id, error = %e, "failed to deliver busy notice");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::InMemoryBridge;
    use crate::config::Config;

    fn test_dispatcher(dir: &std::path::Path) -> (Arc<Dispatcher>, Arc<InMemoryBridge>, mpsc::UnboundedReceiver<RestartRequest>) {
        let config = Config::default();
        let bridges = Arc::new(BridgeRegistry::new());
        let console = Arc::new(InMemoryBridge::new());
        bridges.register(config.primary_user.platform.clone(), console.clone());
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(dir, &config, bridges, restart_tx));
        (dispatcher, console, restart_rx)
    }

    fn user_message(text: &str) -> Message {
        Message::new_user("primary".to_string(), "primary".to_string(), text.to_string(), "console".to_string())
    }

    #[tokio::test]
    async fn help_command_is_intercepted_before_any_llm_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, _restart_rx) = test_dispatcher(dir.path());

        dispatcher.process_message(user_message("/help")).await.unwrap();

        let sent = console.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, HELP_TEXT);
    }

    #[tokio::test]
    async fn start_and_clear_commands_reply_without_touching_a_model() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, _restart_rx) = test_dispatcher(dir.path());

        dispatcher.process_message(user_message("/start")).await.unwrap();
        dispatcher.process_message(user_message("/clear")).await.unwrap();

        let sent = console.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, START_TEXT);
        assert_eq!(sent[1].1, "Session cleared.");
    }

    #[tokio::test]
    async fn memory_command_reports_nothing_remembered_for_a_fresh_user() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, _restart_rx) = test_dispatcher(dir.path());

        dispatcher.process_message(user_message("/memory")).await.unwrap();

        let sent = console.sent();
        assert_eq!(sent[0].1, "Nothing remembered yet.");
    }

    #[tokio::test]
    async fn oversized_text_is_rejected_before_reaching_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, _restart_rx) = test_dispatcher(dir.path());
        let huge = "a".repeat(MAX_TEXT_LEN + 1);

        dispatcher.process_message(user_message(&huge)).await.unwrap();

        let sent = console.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("too long"));
    }

    #[tokio::test]
    async fn restart_command_writes_a_marker_and_signals_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, mut restart_rx) = test_dispatcher(dir.path());

        dispatcher.process_message(user_message("/restart")).await.unwrap();

        assert_eq!(console.sent()[0].1, "Restarting...");
        let request = restart_rx.try_recv().expect("a restart request should have been sent");
        assert_eq!(request.marker.reason, "user requested");
        assert!(dispatcher.crash_recovery().take_restart_marker().await.is_some());
    }

    #[tokio::test]
    async fn reject_handler_notifies_the_right_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, console, _restart_rx) = test_dispatcher(dir.path());

        dispatcher.on_reject(&user_message("hi"), RejectReason::RateLimited);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let sent = console.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("slow down"));
    }
}
