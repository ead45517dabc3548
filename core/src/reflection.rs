//! Offline projection reflection: a periodic, non-agentic pass that reads
//! recent conversation, looks at what's still pending, and asks the model
//! once whether anything should become a new projection or get archived.
//! Grounded on the teacher's `core/src/memory/scribe.rs` (single-shot
//! LLM-summarization-into-structured-memory) for the one-prompt-in,
//! one-JSON-blob-out shape, and on `core/src/agent/v2/protocol/parser.rs`
//! for tolerant ```json fence stripping.

use crate::audit::AuditLog;
use crate::llm::chat::ChatMessage;
use crate::llm::resolve_model;
use crate::projections::{NewProjection, ProjectionStore, Resolution};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const LAST_REFLECTION_META_KEY: &str = "last_reflection_at";
const PENDING_HORIZON_DAYS: i64 = 3650;

pub struct ProjectionReflection {
    projections: Arc<ProjectionStore>,
    audit: Arc<AuditLog>,
    user_id: String,
    model: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReflectionOutput {
    #[serde(default)]
    project: Vec<ProjectionDraft>,
    #[serde(default)]
    archive: Vec<ArchiveEntry>,
}

#[derive(Debug, Deserialize)]
struct ProjectionDraft {
    summary: String,
    #[serde(default)]
    raw_when: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    resolved_when: Option<String>,
    #[serde(default)]
    recurrence: Option<String>,
    #[serde(default)]
    trigger_on_fact: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArchiveEntry {
    id: Uuid,
    #[serde(default)]
    status: Option<String>,
}

impl ProjectionReflection {
    pub fn new(projections: Arc<ProjectionStore>, audit: Arc<AuditLog>, user_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { projections, audit, user_id: user_id.into(), model: model.into() }
    }

    /// Runs the pass unconditionally if there is new conversation since the
    /// last run; a no-op (and no model call) otherwise.
    pub async fn run_if_due(&self) -> anyhow::Result<()> {
        let last_run = self.last_reflection_at().await?;
        let recent = self.audit.conversation_since(&self.user_id, last_run).await?;
        if recent.is_empty() {
            return Ok(());
        }

        let pending = self.projections.get_upcoming(PENDING_HORIZON_DAYS).await?;
        let prompt = build_prompt(&pending, &recent);

        let client = {
            let base = resolve_model(&self.model)?;
            let config = base.config().clone().with_temperature(0.0);
            crate::llm::LlmClient::new(config)?
        };
        let response = client.complete(&prompt).await?;
        let content = response.choices.into_iter().next().map(|c| c.message.content).unwrap_or_default();

        let parsed = match parse_tolerant(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "reflection pass produced unparseable output, skipping this round");
                self.mark_reflected().await?;
                return Ok(());
            }
        };

        for draft in parsed.project {
            if let Err(e) = self.projections.add(draft.into_new_projection()).await {
                warn!(error = %e, "failed to insert projection from reflection pass");
            }
        }
        for entry in parsed.archive {
            let status = entry
                .status
                .as_deref()
                .unwrap_or("done")
                .parse()
                .unwrap_or(crate::projections::ProjectionStatus::Done);
            if let Err(e) = self.projections.resolve(entry.id, status).await {
                warn!(error = %e, "failed to archive projection from reflection pass");
            }
        }

        self.mark_reflected().await?;
        Ok(())
    }

    async fn last_reflection_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let raw = self.projections.get_meta(LAST_REFLECTION_META_KEY).await?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)))
    }

    async fn mark_reflected(&self) -> anyhow::Result<()> {
        self.projections.set_meta(LAST_REFLECTION_META_KEY, &Utc::now().to_rfc3339()).await?;
        Ok(())
    }
}

impl ProjectionDraft {
    fn into_new_projection(self) -> NewProjection {
        NewProjection {
            summary: self.summary,
            raw_when: self.raw_when,
            resolved_when: self.resolved_when.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
            resolution: self.resolution.and_then(|s| s.parse::<Resolution>().ok()),
            recurrence: self.recurrence,
            trigger_on_fact: self.trigger_on_fact,
            context: self.context,
            linked_ids: Vec::new(),
            depends_on: Vec::new(),
        }
    }
}

fn build_prompt(pending: &[crate::projections::Projection], recent: &[crate::audit::ConversationEntry]) -> String {
    let pending_list = if pending.is_empty() {
        "(none)".to_string()
    } else {
        pending
            .iter()
            .map(|p| format!("- id={} summary=\"{}\" raw_when={}", p.id, p.summary, p.raw_when.as_deref().unwrap_or("unspecified")))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let transcript = recent
        .iter()
        .map(|e| format!("{}: {}", e.role, e.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You maintain a list of future commitments (\"projections\") for this user.\n\
         Currently pending:\n{pending_list}\n\n\
         Recent conversation:\n{transcript}\n\n\
         Reply with ONLY a JSON object of the shape \
         {{\"project\": [{{\"summary\": str, \"raw_when\": str|null, \"resolution\": \"exact\"|\"day\"|\"week\"|\"month\"|\"someday\", \
         \"resolved_when\": str|null, \"recurrence\": str|null, \"trigger_on_fact\": str|null, \"context\": str|null}}], \
         \"archive\": [{{\"id\": uuid, \"status\": \"done\"|\"cancelled\"|null}}]}}. \
         Only include projections genuinely implied by the conversation. Use empty arrays if there is nothing to change."
    )
}

fn parse_tolerant(content: &str) -> anyhow::Result<ReflectionOutput> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_end_matches("```")
        .trim();
    Ok(serde_json::from_str(stripped)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tolerant_strips_json_fence() {
        let raw = "```json\n{\"project\": [], \"archive\": []}\n```";
        let parsed = parse_tolerant(raw).unwrap();
        assert!(parsed.project.is_empty());
        assert!(parsed.archive.is_empty());
    }

    #[test]
    fn parse_tolerant_accepts_bare_json() {
        let raw = "{\"project\": [], \"archive\": []}";
        let parsed = parse_tolerant(raw).unwrap();
        assert!(parsed.project.is_empty());
        assert!(parsed.archive.is_empty());
    }

    #[test]
    fn parse_tolerant_rejects_garbage() {
        assert!(parse_tolerant("not json at all").is_err());
    }
}
