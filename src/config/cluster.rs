//! Cluster config YAML model
//!
//! ```yaml
//! global:
//!   ssh_user: ubuntu
//!   ssh_passwd: secret
//!   registry:
//!     user: admin
//!     password: admin
//! nodes:
//!   m1:
//!     ip: 10.0.0.1
//!     tags: [k3s_master]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use yaml_rust::{Yaml, YamlLoader};

/// Container registry credentials shipped to nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConf {
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_store_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_store_admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_store_admin_pw: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConf {
    pub ssh_user: String,
    pub ssh_passwd: String,
    pub registry: Option<RegistryConf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConf {
    pub ip: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub global: GlobalConf,
    pub nodes: BTreeMap<String, NodeConf>,
}

/// A resolved (name, address) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub ip: String,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster config: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse cluster config: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(content).context("Invalid YAML")?;
        let doc = docs.first().context("Cluster config is empty")?;

        let global = &doc["global"];
        let ssh_user = scalar_string(&global["ssh_user"])
            .filter(|s| !s.is_empty())
            .context("global.ssh_user is required")?;
        let ssh_passwd = scalar_string(&global["ssh_passwd"]).unwrap_or_default();
        let registry = parse_registry(&global["registry"])?;

        let mut nodes = BTreeMap::new();
        if let Some(hash) = doc["nodes"].as_hash() {
            for (key, value) in hash {
                let name = scalar_string(key).context("Node name must be a scalar")?;
                let ip = scalar_string(&value["ip"])
                    .filter(|s| !s.is_empty())
                    .with_context(|| format!("nodes.{}.ip is required", name))?;
                let tags = value["tags"]
                    .as_vec()
                    .map(|tags| tags.iter().filter_map(scalar_string).collect())
                    .unwrap_or_default();
                nodes.insert(name, NodeConf { ip, tags });
            }
        }

        Ok(Self {
            global: GlobalConf {
                ssh_user,
                ssh_passwd,
                registry,
            },
            nodes,
        })
    }

    /// Names of nodes carrying `tag`, in name order
    pub fn nodes_with_tag(&self, tag: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.tags.iter().any(|t| t == tag))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn node_ip(&self, name: &str) -> Option<String> {
        self.nodes.get(name).map(|node| node.ip.clone())
    }

    /// `ssh_user@ip` for one address
    pub fn host_for(&self, ip: &str) -> String {
        format!("{}@{}", self.global.ssh_user, ip)
    }

    /// Every configured node as a fleet host, in name order
    pub fn all_hosts(&self) -> Vec<String> {
        self.nodes.values().map(|node| self.host_for(&node.ip)).collect()
    }
}

fn parse_registry(value: &Yaml) -> Result<Option<RegistryConf>> {
    if value.is_badvalue() || value.is_null() {
        return Ok(None);
    }
    if value.as_hash().is_none() {
        anyhow::bail!("global.registry must be a mapping");
    }
    Ok(Some(RegistryConf {
        user: scalar_string(&value["user"]).unwrap_or_default(),
        password: scalar_string(&value["password"]).unwrap_or_default(),
        uploader_store_addr: scalar_string(&value["uploader_store_addr"]),
        uploader_store_admin: scalar_string(&value["uploader_store_admin"]),
        uploader_store_admin_pw: scalar_string(&value["uploader_store_admin_pw"]),
    }))
}

// Passwords and names are often written unquoted, so numbers count too
fn scalar_string(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Real(r) => Some(r.clone()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}
