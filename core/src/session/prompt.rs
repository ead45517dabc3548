//! The system-prompt override closure: re-rendered on every prompt from a
//! static template plus whatever is live at call time (tool list, core
//! memory, upcoming projections), so the agent always sees what its own
//! previous turn changed.

use crate::projections::Projection;
use std::sync::Arc;

#[derive(Clone)]
pub struct PromptContext {
    pub static_prompt: String,
    pub tool_names: Vec<String>,
    pub core_memory: String,
    pub upcoming_projections: Vec<Projection>,
}

pub type PromptRenderer = Arc<dyn Fn(&PromptContext) -> String + Send + Sync>;

pub fn default_renderer() -> PromptRenderer {
    Arc::new(render_default)
}

fn render_default(ctx: &PromptContext) -> String {
    let mut out = String::new();
    out.push_str(&ctx.static_prompt);
    if !ctx.tool_names.is_empty() {
        out.push_str("\n\nAvailable tools: ");
        out.push_str(&ctx.tool_names.join(", "));
    }
    if !ctx.core_memory.is_empty() {
        out.push_str("\n\nWhat you remember about this user:\n");
        out.push_str(&ctx.core_memory);
    }
    if !ctx.upcoming_projections.is_empty() {
        out.push_str("\n\nUpcoming commitments:\n");
        for p in &ctx.upcoming_projections {
            out.push_str(&format!("- {} ({})\n", p.summary, p.resolution.as_str()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tool_names_and_memory() {
        let ctx = PromptContext {
            static_prompt: "You are helpful.".to_string(),
            tool_names: vec!["worker_dispatch".to_string()],
            core_memory: "Prefers terse replies.".to_string(),
            upcoming_projections: Vec::new(),
        };
        let rendered = render_default(&ctx);
        assert!(rendered.contains("You are helpful."));
        assert!(rendered.contains("worker_dispatch"));
        assert!(rendered.contains("Prefers terse replies."));
    }
}
