//! Tool configuration and cluster config loading
//!
//! Tool settings come from the environment (optionally seeded from a `.env`
//! file). The cluster topology comes from an operator-supplied YAML file.

mod cluster;

pub use cluster::{ClusterConfig, GlobalConf, NodeConf, NodeInfo, RegistryConf};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAIN_NODE: &str = "127.0.0.1";
pub const DEFAULT_FILE_SERVER_PORT: u16 = 8003;
pub const DEFAULT_IMG_REPO: &str = "http://127.0.0.1:5000";

/// Tool-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Host serving install scripts, binaries and airgap images
    pub main_node: String,
    pub file_server_port: u16,
    /// Image registry URL including scheme, e.g. `http://10.0.0.2:5000`
    pub img_repo: String,
}

impl AppConfig {
    /// Load settings from `.env` files and the process environment
    pub fn load() -> Result<Self> {
        // cwd (and parents) first, then the workspace .env if one exists
        dotenv::dotenv().ok();
        let workspace = default_workspace_dir(|key| std::env::var(key).ok());
        dotenv::from_path(workspace.join(".env")).ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let workspace_dir = default_workspace_dir(&lookup);
        let log_dir = non_empty("KFLEET_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_dir.join("logs"));
        let main_node = non_empty("KFLEET_MAIN_NODE").unwrap_or_else(|| DEFAULT_MAIN_NODE.into());
        let file_server_port = match non_empty("KFLEET_FILE_SERVER_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("Invalid KFLEET_FILE_SERVER_PORT: {}", port))?,
            None => DEFAULT_FILE_SERVER_PORT,
        };
        let img_repo = non_empty("KFLEET_IMG_REPO").unwrap_or_else(|| DEFAULT_IMG_REPO.into());

        Ok(Self {
            workspace_dir,
            log_dir,
            main_node,
            file_server_port,
            img_repo,
        })
    }

    /// `http://<main_node>:<port>`
    pub fn file_server_url(&self) -> String {
        format!("http://{}:{}", self.main_node, self.file_server_port)
    }

    /// Registry address with the scheme stripped
    pub fn img_repo_no_prefix(&self) -> String {
        self.img_repo
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    /// `KEY=value` settings a remote node needs to reach this node's file
    /// server and registry
    pub fn remote_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("KFLEET_MAIN_NODE", self.main_node.clone()),
            ("KFLEET_FILE_SERVER_PORT", self.file_server_port.to_string()),
            ("KFLEET_IMG_REPO", self.img_repo.clone()),
        ]
    }

    /// Create the log directory if needed and return it
    pub fn ensure_log_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", self.log_dir.display())
        })?;
        Ok(&self.log_dir)
    }
}

fn default_workspace_dir<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("KFLEET_WORKSPACE").filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    let home = lookup("HOME").unwrap_or_else(|| ".".to_string());
    PathBuf::from(home).join(".kfleet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_home() {
        let config = AppConfig::from_lookup(lookup_from(&[("HOME", "/home/ops")])).unwrap();
        assert_eq!(config.workspace_dir, PathBuf::from("/home/ops/.kfleet"));
        assert_eq!(config.log_dir, PathBuf::from("/home/ops/.kfleet/logs"));
        assert_eq!(config.file_server_url(), "http://127.0.0.1:8003");
        assert_eq!(config.img_repo, DEFAULT_IMG_REPO);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("KFLEET_WORKSPACE", "/srv/kfleet"),
            ("KFLEET_LOG_DIR", "/var/log/kfleet"),
            ("KFLEET_MAIN_NODE", "10.0.0.9"),
            ("KFLEET_FILE_SERVER_PORT", "9000"),
            ("KFLEET_IMG_REPO", "https://registry.lan"),
        ]))
        .unwrap();
        assert_eq!(config.workspace_dir, PathBuf::from("/srv/kfleet"));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/kfleet"));
        assert_eq!(config.file_server_url(), "http://10.0.0.9:9000");
        assert_eq!(config.img_repo_no_prefix(), "registry.lan");
    }

    #[test]
    fn test_remote_env_rebuilds_same_endpoints() {
        let coordinator = AppConfig::from_lookup(lookup_from(&[
            ("HOME", "/home/ops"),
            ("KFLEET_MAIN_NODE", "10.0.0.100"),
            ("KFLEET_FILE_SERVER_PORT", "9000"),
        ]))
        .unwrap();
        let env = coordinator.remote_env();
        let node = AppConfig::from_lookup(|key| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .or_else(|| (key == "HOME").then(|| "/root".to_string()))
        })
        .unwrap();
        assert_eq!(node.file_server_url(), "http://10.0.0.100:9000");
        assert_eq!(node.img_repo, DEFAULT_IMG_REPO);
        assert_eq!(node.workspace_dir, PathBuf::from("/root/.kfleet"));
    }

    #[test]
    fn test_bad_port_is_error() {
        let result = AppConfig::from_lookup(lookup_from(&[("KFLEET_FILE_SERVER_PORT", "http")]));
        assert!(result.is_err());
    }
}
