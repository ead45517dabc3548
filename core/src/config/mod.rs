//! Layered YAML configuration: defaults, then an on-disk file, then
//! `MYLM_*` environment overrides.

mod loader;
mod types;

pub use loader::{load, ConfigError};
pub use types::{
    AgentConfig, Config, CronEntry, PrimaryUserConfig, ToolsConfig, TrustConfig, WorkerTypeConfig,
    WorkersConfig,
};
