//! Append-only JSONL audit trails: one conversational history file per user
//! (`history/<user_id>.jsonl`, read by [`ProjectionReflection`](crate::reflection::ProjectionReflection)
//! and rendered by the `/log` command's tool-call view), one shared
//! tool-call log (`logs/tool-calls.jsonl`), and one shared usage/cost log
//! (`logs/usage.jsonl`). Every write is a pure append; nothing here ever
//! rewrites a historical line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub tool_name: String,
    pub arguments_redacted: String,
    pub result_kind: String,
    pub latency_ms: u64,
}

/// Dispatcher telemetry: one row per prompt, appended to `logs/usage.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
}

/// Replaces values of keys that look like secrets with a fixed placeholder
/// before a tool call's arguments are written to the audit log. Falls back
/// to the raw string unchanged if it isn't a JSON object.
pub fn redact_arguments(arguments: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(arguments) else {
        return arguments.to_string();
    };
    if let serde_json::Value::Object(map) = &mut value {
        for (key, val) in map.iter_mut() {
            let lower = key.to_lowercase();
            if lower.contains("token") || lower.contains("key") || lower.contains("password") || lower.contains("secret") {
                *val = serde_json::Value::String("[redacted]".to_string());
            }
        }
    }
    serde_json::to_string(&value).unwrap_or_else(|_| arguments.to_string())
}

pub struct AuditLog {
    history_dir: PathBuf,
    tool_call_log_path: PathBuf,
    usage_log_path: PathBuf,
}

impl AuditLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            history_dir: data_dir.join("history"),
            tool_call_log_path: data_dir.join("logs").join("tool-calls.jsonl"),
            usage_log_path: data_dir.join("logs").join("usage.jsonl"),
        }
    }

    fn history_path(&self, user_id: &str) -> PathBuf {
        self.history_dir.join(format!("{user_id}.jsonl"))
    }

    pub async fn append_conversation(&self, user_id: &str, role: &str, text: &str) -> std::io::Result<()> {
        let entry = ConversationEntry { timestamp: Utc::now(), role: role.to_string(), text: text.to_string() };
        append_jsonl(&self.history_path(user_id), &entry).await
    }

    pub async fn append_tool_call(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &str,
        result_kind: &str,
        latency_ms: u64,
    ) -> std::io::Result<()> {
        let entry = ToolCallEntry {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments_redacted: redact_arguments(arguments),
            result_kind: result_kind.to_string(),
            latency_ms,
        };
        append_jsonl(&self.tool_call_log_path, &entry).await
    }

    pub async fn append_usage(
        &self,
        user_id: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        latency_ms: u64,
        cost_usd: f64,
    ) -> std::io::Result<()> {
        let record = UsageRecord {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            latency_ms,
            cost_usd,
        };
        append_jsonl(&self.usage_log_path, &record).await
    }

    /// Last `count` tool-call entries for `user_id`, oldest first -- what
    /// the `/log` command renders.
    pub async fn recent_tool_calls(&self, user_id: &str, count: usize) -> std::io::Result<Vec<ToolCallEntry>> {
        let all: Vec<ToolCallEntry> = read_jsonl(&self.tool_call_log_path).await?;
        let mut mine: Vec<ToolCallEntry> = all.into_iter().filter(|e| e.user_id == user_id).collect();
        if mine.len() > count {
            mine.drain(0..mine.len() - count);
        }
        Ok(mine)
    }

    /// Conversation entries for `user_id` strictly after `since` (`None`
    /// means everything on disk).
    pub async fn conversation_since(&self, user_id: &str, since: Option<DateTime<Utc>>) -> std::io::Result<Vec<ConversationEntry>> {
        let all: Vec<ConversationEntry> = read_jsonl(&self.history_path(user_id)).await?;
        Ok(match since {
            Some(since) => all.into_iter().filter(|e| e.timestamp > since).collect(),
            None => all,
        })
    }

    pub async fn delete_user_history(&self, user_id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.history_path(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await
}

async fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conversation_since_filters_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.append_conversation("u1", "user", "hello").await.unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        audit.append_conversation("u1", "assistant", "hi there").await.unwrap();

        let all = audit.conversation_since("u1", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let after_cutoff = audit.conversation_since("u1", Some(cutoff)).await.unwrap();
        assert_eq!(after_cutoff.len(), 1);
        assert_eq!(after_cutoff[0].text, "hi there");
    }

    #[tokio::test]
    async fn recent_tool_calls_is_capped_and_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        for i in 0..5 {
            audit.append_tool_call("u1", "fetch_url", "{}", &format!("result-{i}"), 12).await.unwrap();
        }
        audit.append_tool_call("u2", "fetch_url", "{}", "other-user", 12).await.unwrap();

        let recent = audit.recent_tool_calls("u1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().result_kind, "result-4");
    }

    #[tokio::test]
    async fn append_usage_writes_a_row_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.append_usage("u1", "claude-3", 100, 50, 820, 0.0012).await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("logs").join("usage.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("claude-3"));
    }

    #[tokio::test]
    async fn redact_arguments_masks_secret_looking_keys() {
        let redacted = redact_arguments(r#"{"api_key": "sk-live-123", "query": "weather"}"#);
        assert!(redacted.contains("[redacted]"));
        assert!(redacted.contains("weather"));
    }

    #[tokio::test]
    async fn delete_user_history_is_tolerant_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        audit.delete_user_history("nobody").await.unwrap();
        audit.append_conversation("u1", "user", "hi").await.unwrap();
        audit.delete_user_history("u1").await.unwrap();
        assert!(audit.conversation_since("u1", None).await.unwrap().is_empty());
    }
}
