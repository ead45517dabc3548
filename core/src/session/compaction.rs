//! Proactive compaction: idle (every 10 min, per-session threshold) and
//! nightly (03:00 local, unconditional). Both replace a session's message
//! list with a single condensed summary produced by one extra LLM call.

use crate::llm::chat::{ChatMessage, ChatRequest};
use crate::llm::LlmClient;
use chrono::{DateTime, Utc};

pub const IDLE_THRESHOLD_MINUTES: i64 = 30;
pub const IDLE_USAGE_THRESHOLD: f64 = 0.30;

const IDLE_COMPACTION_PROMPT: &str = "Summarize this conversation so far in a way that preserves the \
    user's stated preferences, open commitments, and any ongoing threads of work. Discard verbose tool \
    output and resolved small talk. Be concise.";

const NIGHTLY_COMPACTION_PROMPT: &str = "The day is ending. Summarize this conversation into a compact \
    record of what happened today: decisions made, commitments taken on, and anything still open. This \
    summary becomes the entire memory of today's conversation going forward.";

/// A crude token estimate (chars / 4) good enough to gate compaction without
/// depending on a provider-specific tokenizer.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.len() / 4).sum()
}

pub fn context_usage_fraction(messages: &[ChatMessage], max_context_tokens: usize) -> f64 {
    if max_context_tokens == 0 {
        return 0.0;
    }
    estimate_tokens(messages) as f64 / max_context_tokens as f64
}

pub fn should_idle_compact(
    last_user_message_at: Option<DateTime<Utc>>,
    messages: &[ChatMessage],
    max_context_tokens: usize,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = last_user_message_at else {
        return false;
    };
    let idle_minutes = (now - last).num_minutes();
    idle_minutes >= IDLE_THRESHOLD_MINUTES
        && context_usage_fraction(messages, max_context_tokens) >= IDLE_USAGE_THRESHOLD
}

pub async fn compact(llm: &LlmClient, model: &str, messages: &[ChatMessage], nightly: bool) -> anyhow::Result<Vec<ChatMessage>> {
    let prompt = if nightly { NIGHTLY_COMPACTION_PROMPT } else { IDLE_COMPACTION_PROMPT };
    let mut request_messages = messages.to_vec();
    request_messages.push(ChatMessage::user(prompt));
    let request = ChatRequest::new(model.to_string(), request_messages).with_temperature(0.0);
    let response = llm.chat(&request).await?;
    let summary = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default();
    Ok(vec![ChatMessage::system(format!(
        "Summary of the conversation prior to this point:\n{summary}"
    ))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_compaction_requires_both_age_and_usage() {
        let now = Utc::now();
        let long_ago = now - chrono::Duration::minutes(45);
        let big_messages: Vec<ChatMessage> = (0..50).map(|_| ChatMessage::user("x".repeat(400))).collect();

        assert!(should_idle_compact(Some(long_ago), &big_messages, 1000, now));
        assert!(!should_idle_compact(Some(now), &big_messages, 1000, now));
        assert!(!should_idle_compact(Some(long_ago), &[ChatMessage::user("hi")], 100_000, now));
    }
}
