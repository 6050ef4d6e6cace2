//! Distributed cluster bootstrap
//!
//! The coordinator discovers the current master/worker layout, reconciles it
//! against the tags in the cluster config, and then runs this same binary on
//! each target node with `distribute-deploy --mode this_master|this_worker`.

pub mod context;
mod k3s;
mod orchestrator;
pub mod registry;

pub use k3s::K3sDeployer;
pub use orchestrator::{NodeResolver, Orchestrator};

use crate::config::{AppConfig, ClusterConfig, NodeInfo};
use crate::fleet::RemoteFleet;
use anyhow::Result;
use std::sync::Arc;
use thiserror::Error;

pub const BINARY_NAME: &str = "kfleet";
pub const SUBCOMMAND: &str = "distribute-deploy";

/// Errors callers need to tell apart; everything else is plain `anyhow`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("masters are already set up: {}", .existing.join(", "))]
    MastersAlreadySetup { existing: Vec<String> },
    #[error("no target masters found in cluster config")]
    NoTargetMasters,
    #[error("node {0} not found in cluster config")]
    NodeNotInConfig(String),
    #[error("failed to get join token from {0}")]
    EmptyJoinToken(String),
    #[error("unsupported deployer: '{0}'")]
    UnknownDeployer(String),
}

/// Cluster engine specific discovery and install steps
pub trait Deployer {
    /// Also the tag prefix (`<name>_master`, `<name>_worker`)
    fn name(&self) -> &str;

    fn check_master(&self, conf: &ClusterConfig) -> Result<Vec<NodeInfo>>;
    fn check_worker(&self, conf: &ClusterConfig) -> Result<Vec<NodeInfo>>;

    fn prepare_worker_setup_ctx_base64(
        &self,
        masters: &[NodeInfo],
        conf: &ClusterConfig,
    ) -> Result<String>;
    fn prepare_master_setup_ctx_base64(
        &self,
        masters: &[NodeInfo],
        conf: &ClusterConfig,
    ) -> Result<String>;

    /// Runs on the node itself
    fn this_node_general_install(&self) -> Result<()>;
    fn this_node_master_install(&self, ctx_b64: &str) -> Result<()>;
    fn this_node_worker_install(&self, ctx_b64: &str) -> Result<()>;

    fn master_tag(&self) -> String {
        format!("{}_master", self.name())
    }

    fn worker_tag(&self) -> String {
        format!("{}_worker", self.name())
    }
}

/// Look up a deployer by its `--deployer` name
pub fn new_deployer(
    name: &str,
    fleet: Arc<dyn RemoteFleet>,
    app: &AppConfig,
) -> Result<Box<dyn Deployer>> {
    match name {
        k3s::NAME => Ok(Box::new(K3sDeployer::new(fleet, app.clone()))),
        other => Err(DeployError::UnknownDeployer(other.to_string()).into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    All,
    ThisMaster,
    ThisWorker,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::All => "distribute_deploy_all",
            DeployMode::ThisMaster => "distribute_deploy_this_master",
            DeployMode::ThisWorker => "distribute_deploy_this_worker",
        }
    }

    pub fn parse(mode: &str) -> Option<Self> {
        [DeployMode::All, DeployMode::ThisMaster, DeployMode::ThisWorker]
            .into_iter()
            .find(|m| m.as_str() == mode)
    }
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One self-invocation of `kfleet distribute-deploy`
pub struct DeployJob<'a> {
    pub deployer: &'a str,
    pub mode: DeployMode,
}

impl DeployJob<'_> {
    pub fn new_cmd(&self, ctx_b64: &str) -> Vec<String> {
        let mut cmd = vec![
            BINARY_NAME.to_string(),
            SUBCOMMAND.to_string(),
            "--deployer".to_string(),
            self.deployer.to_string(),
            "--mode".to_string(),
            self.mode.as_str().to_string(),
        ];
        if !ctx_b64.is_empty() {
            cmd.push("--install-this-ctx".to_string());
            cmd.push(ctx_b64.to_string());
        }
        cmd
    }
}

/// Shell one-liner that installs this binary from the main node's file server
pub fn install_preamble(app: &AppConfig) -> String {
    format!(
        "python3 -c \"import urllib.request; script = urllib.request.urlopen('{}/bin_{}/install.py').read(); exec(script.decode());\"",
        app.file_server_url(),
        BINARY_NAME
    )
}

/// Full remote command: install preamble, then the distribute-deploy call.
/// The node inherits this node's file server and registry settings.
pub fn remote_install_cmd(app: &AppConfig, job: &DeployJob<'_>, ctx_b64: &str) -> String {
    let env: Vec<String> = app
        .remote_env()
        .into_iter()
        .map(|(key, value)| format!("{}='{}'", key, value.replace('\'', "")))
        .collect();
    format!(
        "{} && {} {}",
        install_preamble(app),
        env.join(" "),
        job.new_cmd(ctx_b64).join(" ")
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::fleet::{FleetReport, RemoteFleet};
    use std::sync::Mutex;

    /// Records every fleet call and answers each host through `respond`
    pub struct ScriptedFleet<F> {
        pub calls: Mutex<Vec<(Vec<String>, String)>>,
        respond: F,
    }

    impl<F> ScriptedFleet<F>
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync,
    {
        pub fn new(respond: F) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond,
            }
        }

        pub fn calls(&self) -> Vec<(Vec<String>, String)> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls whose command contains `needle`
        pub fn calls_with(&self, needle: &str) -> Vec<(Vec<String>, String)> {
            self.calls()
                .into_iter()
                .filter(|(_, cmd)| cmd.contains(needle))
                .collect()
        }
    }

    impl<F> RemoteFleet for ScriptedFleet<F>
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync,
    {
        fn run(&self, hosts: &[String], command: &str, _password: &str) -> FleetReport {
            self.calls
                .lock()
                .unwrap()
                .push((hosts.to_vec(), command.to_string()));
            let answers: Vec<Option<String>> =
                hosts.iter().map(|h| (self.respond)(h.as_str(), command)).collect();
            FleetReport {
                exit_codes: answers.iter().map(|a| a.as_ref().map(|_| 0)).collect(),
                outputs: answers.into_iter().map(Option::unwrap_or_default).collect(),
                log_paths: Vec::new(),
            }
        }
    }
}
