//! Agent configuration.
//!
//! Loaded from `~/.clusterlink/config.toml` by the agent crate, then
//! overridden field-by-field from the environment.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Environment variable overriding [`AgentConfig::url`].
pub const ENV_URL: &str = "CLUSTERLINK_URL";
/// Environment variable overriding [`AgentConfig::root`].
pub const ENV_ROOT: &str = "CLUSTERLINK_ROOT";
/// Environment variable overriding [`AgentConfig::cluster_uuid`].
pub const ENV_CLUSTER_UUID: &str = "CLUSTERLINK_CLUSTER_UUID";

/// Suffix appended to the base URL to reach the directory endpoint.
pub const RPC_INFO_SUFFIX: &str = "rpc/";

/// Location of the shared secret relative to [`AgentConfig::root`].
pub const SECRET_RELATIVE_PATH: &str = "var/lib/clusterlink/secret";

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the region, e.g. `http://region.example.com/MAAS/`.
    pub url: String,
    /// Root directory under which on-disk state (the shared secret) lives.
    pub root: PathBuf,
    /// Identity this cluster reports through its own `Identify` command.
    pub cluster_uuid: String,
    /// Lower bound of the randomized directory poll interval (seconds).
    pub poll_interval_min_secs: u64,
    /// Upper bound of the randomized directory poll interval (seconds).
    pub poll_interval_max_secs: u64,
    /// TCP connect timeout for a new channel (seconds).
    pub connect_timeout_secs: u64,
    /// Timeout for a single directory fetch (seconds).
    pub directory_timeout_secs: u64,
    /// Where the cluster's own RPC server listens. `None` disables it.
    pub listen_addr: Option<SocketAddr>,
    /// Directory scanned for boot images served by `ListBootImages`.
    pub tftp_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5240/".to_string(),
            root: PathBuf::from("/"),
            cluster_uuid: uuid::Uuid::new_v4().to_string(),
            poll_interval_min_secs: 30,
            poll_interval_max_secs: 90,
            connect_timeout_secs: 30,
            directory_timeout_secs: 30,
            listen_addr: None,
            tftp_root: PathBuf::from("/var/lib/clusterlink/boot-resources/current"),
        }
    }
}

impl AgentConfig {
    /// URL of the directory endpoint: the base URL plus `rpc/`.
    pub fn rpc_info_url(&self) -> String {
        format!("{}{}", self.url, RPC_INFO_SUFFIX)
    }

    /// Path of the shared-secret file.
    pub fn secret_path(&self) -> PathBuf {
        self.root.join(SECRET_RELATIVE_PATH)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL).filter(|v| !v.is_empty()) {
            self.url = url;
        }
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
        if let Some(uuid) = lookup(ENV_CLUSTER_UUID).filter(|v| !v.is_empty()) {
            self.cluster_uuid = uuid;
        }
    }
}

/// Default config file location: `~/.clusterlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clusterlink")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rpc_info_url_appends_suffix() {
        let config = AgentConfig {
            url: "http://region.example.com/MAAS/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.rpc_info_url(), "http://region.example.com/MAAS/rpc/");
    }

    #[test]
    fn test_secret_path_under_root() {
        let config = AgentConfig {
            root: PathBuf::from("/tmp/root"),
            ..Default::default()
        };
        assert_eq!(
            config.secret_path(),
            PathBuf::from("/tmp/root/var/lib/clusterlink/secret")
        );
    }

    #[test]
    fn test_overrides_replace_fields() {
        let env: HashMap<&str, &str> = [
            (ENV_URL, "http://other/"),
            (ENV_ROOT, "/srv"),
            (ENV_CLUSTER_UUID, ""),
        ]
        .into_iter()
        .collect();
        let mut config = AgentConfig::default();
        let uuid_before = config.cluster_uuid.clone();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.url, "http://other/");
        assert_eq!(config.root, PathBuf::from("/srv"));
        // Empty values are ignored.
        assert_eq!(config.cluster_uuid, uuid_before);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AgentConfig = toml::from_str(r#"url = "http://r/""#).unwrap();
        assert_eq!(config.url, "http://r/");
        assert_eq!(config.poll_interval_min_secs, 30);
        assert_eq!(config.poll_interval_max_secs, 90);
        assert!(config.listen_addr.is_none());
    }
}
