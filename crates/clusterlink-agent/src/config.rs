//! Configuration loading from `~/.clusterlink/config.toml` with defaults.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, then the
//! `CLUSTERLINK_*` environment variables. A missing or broken file is logged
//! and falls back to defaults; it never stops the agent.

use clusterlink_types::config::default_config_path;
use clusterlink_types::AgentConfig;
use std::path::Path;
use tracing::{info, warn};

/// Load agent configuration from a TOML file and the environment.
pub fn load_config(path: Option<&Path>) -> AgentConfig {
    let mut config = read_config_file(path);
    config.apply_env_overrides();
    config
}

/// Like [`load_config`], reading overrides through `lookup`.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> AgentConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = read_config_file(path);
    config.apply_overrides(lookup);
    config
}

fn read_config_file(path: Option<&Path>) -> AgentConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return AgentConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<AgentConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
        }
    }

    AgentConfig::default()
}
