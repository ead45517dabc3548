//! Turns a bare `provider/model` string -- the only form the agent config and
//! the fallback chain ever carry -- into a fully-built [`LlmClient`].
//!
//! Grounded on the teacher's `EndpointConfig` (api-key env fallback, one
//! default-URL-per-provider table) generalized so [`SessionManager`] can
//! rebuild a client for whichever model the fallback chain is currently
//! trying, since [`LlmClient::chat`] always sends its own `config.model`
//! rather than the request's.
//!
//! [`SessionManager`]: crate::session::SessionManager

use super::{LlmClient, LlmConfig, LlmProvider};
use anyhow::{anyhow, Result};
use std::str::FromStr;

/// `LlmProvider` collapses several provider *names* (openai, ollama,
/// lmstudio, local, openrouter) into one OpenAI-compatible wire format, so
/// the default base URL has to be looked up by name, not by the collapsed
/// enum variant.
fn default_base_url(provider_name: &str, provider: LlmProvider) -> &'static str {
    match provider_name {
        "ollama" => "http://localhost:11434/v1",
        "lmstudio" => "http://localhost:1234/v1",
        "local" => "http://localhost:8080/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        _ => match provider {
            LlmProvider::OpenAiCompatible => "https://api.openai.com/v1",
            LlmProvider::GoogleGenerativeAi => "https://generativelanguage.googleapis.com",
            LlmProvider::MoonshotKimi => "https://api.moonshot.cn/v1",
        },
    }
}

fn api_key_for(provider_name: &str, provider: LlmProvider) -> Option<String> {
    if let Ok(key) = std::env::var("MYLM_API_KEY") {
        if !key.is_empty() {
            return Some(key);
        }
    }
    let env_var = match provider_name {
        "ollama" | "lmstudio" | "local" => return None,
        "openrouter" => "OPENROUTER_API_KEY",
        "moonshot" | "kimi" => "MOONSHOT_API_KEY",
        _ => match provider {
            LlmProvider::GoogleGenerativeAi => "GOOGLE_API_KEY",
            _ => "OPENAI_API_KEY",
        },
    };
    std::env::var(env_var).ok().filter(|k| !k.is_empty())
}

/// Parses `"provider/model-id"` (the model id may itself contain `/`, e.g.
/// OpenRouter's `openrouter/anthropic/claude-3-opus`) and builds a client
/// ready to send requests for it.
pub fn resolve(model_spec: &str) -> Result<LlmClient> {
    let (provider_name, model_id) = model_spec
        .split_once('/')
        .ok_or_else(|| anyhow!("model spec '{model_spec}' is missing a provider/ prefix"))?;
    let provider = LlmProvider::from_str(provider_name).map_err(|e| anyhow!(e))?;
    let base_url = default_base_url(provider_name, provider).to_string();
    let api_key = api_key_for(provider_name, provider);
    let config = LlmConfig::new(provider, base_url, model_id.to_string(), api_key);
    LlmClient::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_providers() {
        let client = resolve("openai/gpt-4o-mini").unwrap();
        assert_eq!(client.model(), "gpt-4o-mini");
        assert_eq!(client.provider(), LlmProvider::OpenAiCompatible);

        let client = resolve("ollama/llama3.2").unwrap();
        assert_eq!(client.config().base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn rejects_a_spec_with_no_provider_prefix() {
        assert!(resolve("gpt-4o-mini").is_err());
    }

    #[test]
    fn rejects_an_unknown_provider() {
        assert!(resolve("anthropic/claude-3-opus").is_err());
    }
}
