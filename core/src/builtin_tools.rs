//! The small, network-reaching tool set workers and sessions are allowed to
//! use unscoped from their working directory (see
//! [`WORKER_TOOL_ALLOWLIST`](crate::workers::WORKER_TOOL_ALLOWLIST)).
//!
//! Kept deliberately thin: no provider-specific search API, no streaming,
//! no TUI event plumbing -- just a GET and a best-effort text extraction,
//! generalized down from the teacher's provider-specific `WebSearchTool`
//! to the two primitives this runtime actually needs.

use crate::tool::{Capability, Tool};
use async_trait::async_trait;
use serde::Deserialize;

const MAX_RESPONSE_BYTES: usize = 16 * 1024;
const REQUEST_TIMEOUT_SECS: u64 = 20;

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .user_agent("mylm-assistant/0.3")
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_RESPONSE_BYTES {
        text.truncate(MAX_RESPONSE_BYTES);
        text.push_str("... [truncated]");
    }
    text
}

#[derive(Deserialize)]
struct FetchUrlParams {
    url: String,
}

pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl Default for FetchUrlTool {
    fn default() -> Self {
        Self { client: http_client() }
    }
}

impl FetchUrlTool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }
    fn description(&self) -> &str {
        "Fetch the text content of a URL."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        })
    }
    fn capability(&self) -> Capability {
        Capability::Safe
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let params: FetchUrlParams = serde_json::from_str(args)?;
        let response = self.client.get(&params.url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("fetch_url: {} returned {}", params.url, status);
        }
        Ok(truncate(body))
    }
}

#[derive(Deserialize)]
struct WebSearchParams {
    query: String,
}

/// Hits DuckDuckGo's HTML endpoint (no API key required) and returns the
/// raw result markup for the model to read -- a pragmatic stand-in for a
/// provider-specific search API this runtime has no credentials for.
pub struct WebSearchTool {
    client: reqwest::Client,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self { client: http_client() }
    }
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web for a query and return the result page text."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }
    fn capability(&self) -> Capability {
        Capability::Safe
    }
    async fn call(&self, args: &str) -> anyhow::Result<String> {
        let params: WebSearchParams = serde_json::from_str(args)?;
        let response = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", params.query.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("web_search: provider returned {}", status);
        }
        Ok(truncate(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "a".repeat(MAX_RESPONSE_BYTES + 500);
        let truncated = truncate(long);
        assert!(truncated.ends_with("... [truncated]"));
        assert!(truncated.len() < MAX_RESPONSE_BYTES + 50);
    }
}
