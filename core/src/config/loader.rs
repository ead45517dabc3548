//! Layered configuration loading: defaults -> `config.yml` -> environment.
//!
//! This module turns a parsed YAML document into the [`Config`](super::Config)
//! the rest of the crate depends on, following a defaults-then-overlay
//! shape: built-in defaults, an on-disk file if present, then `MYLM_*`
//! environment overrides applied last.

use super::types::Config;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yml::Error,
    },
}

/// Load configuration from `path` (if it exists) and apply environment
/// overrides. A missing file is not an error -- defaults apply.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// `MYLM_*` environment overrides, applied last so an operator can patch a
/// single value without editing the YAML file (e.g. in a container).
fn apply_env_overrides(config: &mut Config) {
    if let Ok(model) = std::env::var("MYLM_AGENT_MODEL") {
        config.agent.model = model;
    }
    if let Ok(tz) = std::env::var("MYLM_AGENT_TIMEZONE") {
        config.agent.timezone = tz;
    }
    if let Ok(max) = std::env::var("MYLM_WORKERS_MAX_CONCURRENT") {
        if let Ok(max) = max.parse() {
            config.tools.workers.max_concurrent = max;
        }
    }
    if let Ok(dir) = std::env::var("MYLM_DATA_DIR") {
        config.data_dir = Some(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load(Path::new("/nonexistent/path/config.yml")).unwrap();
        assert_eq!(cfg.agent.timezone, "UTC");
        assert_eq!(cfg.tools.workers.max_concurrent, 3);
    }

    #[test]
    fn parses_yaml_and_layers_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            r#"
agent:
  model: "anthropic/claude-sonnet"
  fallback_models: ["openai/gpt-4o-mini"]
  timezone: "America/New_York"
tools:
  workers:
    max_concurrent: 5
cron:
  - expression: "0 9 * * *"
    message: "good morning"
trust:
  approved_tools: ["fetch_url"]
"#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.agent.model, "anthropic/claude-sonnet");
        assert_eq!(cfg.agent.fallback_models, vec!["openai/gpt-4o-mini"]);
        assert_eq!(cfg.tools.workers.max_concurrent, 5);
        assert_eq!(cfg.cron.len(), 1);
        assert_eq!(cfg.trust.approved_tools, vec!["fetch_url"]);
    }
}
