//! k3s deployer
//!
//! Discovery runs `k3s kubectl get nodes` on every configured node and reads
//! the first answer that looks like a node table. Install steps run locally
//! on the node being installed.

use super::context::{self, GeneralSetupCtx, MasterSetupCtx, WorkerSetupCtx};
use super::{DeployError, Deployer, registry};
use crate::config::{AppConfig, ClusterConfig, NodeInfo, RegistryConf};
use crate::fleet::RemoteFleet;
use crate::utils::bin::ensure_k3s_binary;
use crate::utils::exec::{CommandRunner, LocalCmd, SystemRunner};
use crate::utils::network::{current_arch, download_file};
use crate::utils::print_step;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "k3s";

const CHECK_MASTER_CMD: &str = "k3s kubectl get nodes --selector='node-role.kubernetes.io/master'";
const CHECK_NODES_CMD: &str = "k3s kubectl get nodes";
const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";
const API_PORT: u16 = 6443;
const STAGING_DIR: &str = "/tmp/k3s";
const IMAGES_DIR: &str = "/var/lib/rancher/k3s/agent/images/";

pub struct K3sDeployer {
    fleet: Arc<dyn RemoteFleet>,
    app: AppConfig,
    runner: Arc<dyn CommandRunner>,
}

impl K3sDeployer {
    pub fn new(fleet: Arc<dyn RemoteFleet>, app: AppConfig) -> Self {
        Self::with_runner(fleet, app, Arc::new(SystemRunner))
    }

    /// Deployer whose on-node steps go through `runner`
    pub fn with_runner(
        fleet: Arc<dyn RemoteFleet>,
        app: AppConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self { fleet, app, runner }
    }

    fn airgap_file(&self) -> String {
        format!("k3s-airgap-images-{}.tar.gz", current_arch())
    }

    /// Fetch `file_name` from the file server into `dir` unless already there
    fn download_resource(&self, file_name: &str, dir: &str) -> Result<()> {
        let dest = Path::new(dir).join(file_name);
        if dest.exists() {
            println!("✓ File {} already exists, skip downloading", dest.display());
            return Ok(());
        }
        let url = format!("{}/bin_k3s/{}", self.app.file_server_url(), file_name);
        download_file(&url, &dest)
    }

    /// Write registries.yaml when the context carries registry credentials
    fn apply_registry(&self, registry: Option<&RegistryConf>) -> Result<()> {
        let Some(registry) = registry else {
            println!("no registry config");
            return Ok(());
        };
        print_step("Registry", "updating registry...");
        let content = registry::render(registry, &self.app)?;
        registry::install(self.runner.as_ref(), &content)
            .context("Failed to update registries.yaml")
    }

    fn run_install_script(&self, envs: &[(&str, &str)]) -> Result<()> {
        let mut cmd = LocalCmd::new("bash")
            .arg("./install.sh")
            .with_root()
            .env("INSTALL_K3S_SKIP_DOWNLOAD", "true")
            .dir(STAGING_DIR)
            .show_progress();
        for (k, v) in envs {
            cmd = cmd.env(k, *v);
        }
        self.runner.run(&cmd).context("k3s install.sh failed")?;
        Ok(())
    }

    fn restart(&self, service: &str) -> Result<()> {
        let cmd = LocalCmd::new("systemctl")
            .args(["restart", service])
            .with_root()
            .show_progress();
        self.runner
            .run(&cmd)
            .with_context(|| format!("Failed to restart {}", service))?;
        Ok(())
    }

    fn discover(
        &self,
        conf: &ClusterConfig,
        command: &str,
        marker: &str,
        row: fn(&str) -> bool,
    ) -> Result<Vec<NodeInfo>> {
        let outputs = self
            .fleet
            .start_remote_cmds(&conf.all_hosts(), command, &conf.global.ssh_passwd);
        let Some(table) = outputs.iter().find(|out| out.contains(marker)) else {
            return Ok(Vec::new());
        };
        debug!("node table:\n{}", table);
        resolve_names(conf, &node_names(table, row))
    }
}

/// `(STATUS, ROLES)` of a `kubectl get nodes` row
fn status_and_roles(line: &str) -> Option<(&str, &str)> {
    let mut cols = line.split_whitespace().skip(1);
    Some((cols.next()?, cols.next()?))
}

fn is_server_role(roles: &str) -> bool {
    roles
        .split(',')
        .any(|role| role == "master" || role == "control-plane")
}

fn master_row(line: &str) -> bool {
    matches!(
        status_and_roles(line),
        Some((status, roles)) if status.starts_with("Ready") && is_server_role(roles)
    )
}

fn worker_row(line: &str) -> bool {
    matches!(
        status_and_roles(line),
        Some((status, roles)) if status.starts_with("Ready") && !is_server_role(roles)
    )
}

/// First column of every row accepted by `row`
pub(crate) fn node_names(table: &str, row: fn(&str) -> bool) -> Vec<String> {
    table
        .lines()
        .filter(|line| row(line))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn resolve_names(conf: &ClusterConfig, names: &[String]) -> Result<Vec<NodeInfo>> {
    names
        .iter()
        .map(|name| {
            conf.node_ip(name)
                .map(|ip| NodeInfo {
                    name: name.clone(),
                    ip,
                })
                .ok_or_else(|| DeployError::NodeNotInConfig(name.clone()).into())
        })
        .collect()
}

impl Deployer for K3sDeployer {
    fn name(&self) -> &str {
        NAME
    }

    fn check_master(&self, conf: &ClusterConfig) -> Result<Vec<NodeInfo>> {
        self.discover(conf, CHECK_MASTER_CMD, "master", master_row)
    }

    /// Ready agents; server nodes are left out
    fn check_worker(&self, conf: &ClusterConfig) -> Result<Vec<NodeInfo>> {
        let workers = self.discover(conf, CHECK_NODES_CMD, "Ready", worker_row)?;
        debug!("k3s workers: {:?}", workers);
        Ok(workers)
    }

    fn prepare_worker_setup_ctx_base64(
        &self,
        masters: &[NodeInfo],
        conf: &ClusterConfig,
    ) -> Result<String> {
        print_step("PrepareWorkerSetupCtx", "getting token from master node");
        let master = masters.first().ok_or(DeployError::NoTargetMasters)?;
        let host = conf.host_for(&master.ip);
        let report = self.fleet.run(
            std::slice::from_ref(&host),
            &format!("cat {}", TOKEN_PATH),
            &conf.global.ssh_passwd,
        );

        let token: String = report
            .outputs
            .first()
            .map(|out| out.chars().filter(|c| !c.is_whitespace()).collect())
            .unwrap_or_default();
        if token.is_empty() || !report.succeeded(0) {
            return Err(DeployError::EmptyJoinToken(host).into());
        }
        debug!("got join token from {}", master.ip);

        context::encode(&WorkerSetupCtx {
            general: GeneralSetupCtx {
                registry: conf.global.registry.clone(),
            },
            token,
            server: format!("https://{}:{}", master.ip, API_PORT),
        })
    }

    fn prepare_master_setup_ctx_base64(
        &self,
        _masters: &[NodeInfo],
        conf: &ClusterConfig,
    ) -> Result<String> {
        context::encode(&MasterSetupCtx {
            general: GeneralSetupCtx {
                registry: conf.global.registry.clone(),
            },
        })
    }

    fn this_node_general_install(&self) -> Result<()> {
        print_step("ThisNodeGeneralInstall", "installing k3s binary...");
        let k3s = ensure_k3s_binary(&self.app)?;
        if k3s != Path::new("/usr/local/bin/k3s") {
            let cp = LocalCmd::new("cp")
                .arg(k3s.to_string_lossy())
                .arg("/usr/local/bin/k3s")
                .with_root();
            self.runner
                .run(&cp)
                .context("Failed to copy k3s into /usr/local/bin")?;
        }
        self.runner.run(
            &LocalCmd::new("chmod")
                .args(["555", "/usr/local/bin/k3s"])
                .with_root(),
        )?;

        print_step("ThisNodeGeneralInstall", "preparing bundled resources...");
        let airgap = self.airgap_file();
        self.download_resource("install.sh", STAGING_DIR)?;
        self.download_resource(&airgap, STAGING_DIR)?;

        print_step("ThisNodeGeneralInstall", "preparing images...");
        self.runner.run(
            &LocalCmd::new("mkdir")
                .args(["-p", IMAGES_DIR])
                .with_root()
                .show_progress(),
        )?;
        self.runner.run(
            &LocalCmd::new("chown")
                .args(["-R", whoami::username().as_str(), IMAGES_DIR])
                .with_root()
                .show_progress(),
        )?;
        let stage = LocalCmd::new("cp")
            .arg(format!("{}/{}", STAGING_DIR, airgap))
            .arg(IMAGES_DIR)
            .show_progress();
        self.runner
            .run(&stage)
            .context("Failed to stage airgap images")?;
        Ok(())
    }

    fn this_node_master_install(&self, ctx_b64: &str) -> Result<()> {
        print_step("ThisNodeMasterInstall", "start install master...");
        let ctx: MasterSetupCtx = context::decode(ctx_b64)?;
        self.apply_registry(ctx.general.registry.as_ref())?;
        self.run_install_script(&[])?;
        self.restart("k3s")
    }

    fn this_node_worker_install(&self, ctx_b64: &str) -> Result<()> {
        print_step("ThisNodeWorkerInstall", "start install worker...");
        let ctx: WorkerSetupCtx = context::decode(ctx_b64)?;
        self.apply_registry(ctx.general.registry.as_ref())?;
        self.run_install_script(&[
            ("K3S_URL", ctx.server.as_str()),
            ("K3S_TOKEN", ctx.token.as_str()),
        ])?;
        self.restart("k3s-agent")
    }
}
