//! Transcript repair: tool-call / tool-result pairing can be left
//! inconsistent by a partial write, a crash mid-turn, or a provider that
//! drops a result. This is pure, synchronous, and idempotent -- running it
//! twice on the same list makes no further change, which is asserted by a
//! property test below.

use crate::llm::chat::{ChatMessage, MessageRole};

const SYNTHETIC_RESULT: &str = "[no result recorded -- worker or session did not respond before the transcript was persisted]";

/// Scans `messages` for unmatched tool calls, orphan tool results, and
/// duplicate results, and returns a corrected copy.
pub fn repair(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending: Vec<String> = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::Assistant if message.tool_calls.as_ref().is_some_and(|c| !c.is_empty()) => {
                flush_pending(&mut pending, &mut out);
                pending = message
                    .tool_calls
                    .as_ref()
                    .unwrap()
                    .iter()
                    .map(|c| c.id.clone())
                    .collect();
                out.push(message);
            }
            MessageRole::Tool => {
                let Some(id) = &message.tool_call_id else {
                    // A tool-role message with no call id to pair against is
                    // itself a corruption; drop it.
                    continue;
                };
                if let Some(pos) = pending.iter().position(|p| p == id) {
                    pending.remove(pos);
                    out.push(message);
                }
                // else: orphan or duplicate result -- drop.
            }
            _ => {
                flush_pending(&mut pending, &mut out);
                out.push(message);
            }
        }
    }
    flush_pending(&mut pending, &mut out);
    out
}

fn flush_pending(pending: &mut Vec<String>, out: &mut Vec<ChatMessage>) {
    for id in pending.drain(..) {
        out.push(ChatMessage::tool_result(id, SYNTHETIC_RESULT));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::{ToolCall, ToolCallFunction};

    fn assistant_with_call(id: &str) -> ChatMessage {
        let mut m = ChatMessage::assistant("");
        m.tool_calls = Some(vec![ToolCall {
            id: id.to_string(),
            type_: "function".to_string(),
            function: ToolCallFunction { name: "noop".to_string(), arguments: "{}".to_string() },
        }]);
        m
    }

    #[test]
    fn synthesizes_a_result_for_an_unmatched_call() {
        let messages = vec![ChatMessage::user("hi"), assistant_with_call("c1")];
        let repaired = repair(messages);
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[2].role, MessageRole::Tool);
        assert_eq!(repaired[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn drops_an_orphan_result() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::tool_result("ghost", "x")];
        let repaired = repair(messages);
        assert_eq!(repaired.len(), 1);
    }

    #[test]
    fn drops_a_duplicate_result() {
        let messages = vec![
            assistant_with_call("c1"),
            ChatMessage::tool_result("c1", "first"),
            ChatMessage::tool_result("c1", "second"),
        ];
        let repaired = repair(messages);
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[1].content, "first");
    }

    #[test]
    fn repair_is_idempotent() {
        let messages = vec![
            ChatMessage::user("hi"),
            assistant_with_call("c1"),
            ChatMessage::user("follow up, no result ever came"),
        ];
        let once = repair(messages);
        let twice = repair(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.tool_call_id, b.tool_call_id);
        }
    }
}
