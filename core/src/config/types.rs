//! Typed configuration the core actually consumes.
//!
//! A small, flat set of keys layered over sensible defaults. Any other key
//! present in `config.yml` (provider credentials, channel-bridge specific
//! settings, etc.) belongs to an external collaborator and is not modeled
//! here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub cron: Vec<CronEntry>,
    pub trust: TrustConfig,
    pub primary_user: PrimaryUserConfig,
    pub data_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            cron: Vec::new(),
            trust: TrustConfig::default(),
            primary_user: PrimaryUserConfig::default(),
            data_dir: None,
        }
    }
}

/// The single user operator cron and projection-maintenance jobs address --
/// this runtime has no multi-tenant routing, so "the first allowed user"
/// from the spec is just this one configured target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryUserConfig {
    pub user_id: String,
    pub channel_id: String,
    pub platform: String,
}

impl Default for PrimaryUserConfig {
    fn default() -> Self {
        Self {
            user_id: "primary".to_string(),
            channel_id: "primary".to_string(),
            platform: "console".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary model string, `provider/id`.
    pub model: String,
    /// Tried in order on prompt failure.
    pub fallback_models: Vec<String>,
    /// Override model used only for the offline reflection pass.
    pub reflection_model: Option<String>,
    /// IANA timezone; defaults to UTC.
    pub timezone: String,
    /// Static portion of the system prompt.
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            fallback_models: Vec::new(),
            reflection_model: None,
            timezone: "UTC".to_string(),
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsConfig {
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent: usize,
    /// Model to fall back on for a worker when neither an explicit
    /// override nor a named `type` supplies one.
    pub model: Option<String>,
    pub types: HashMap<String, WorkerTypeConfig>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            model: None,
            types: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerTypeConfig {
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrustConfig {
    pub approved_tools: Vec<String>,
}
