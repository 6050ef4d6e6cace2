//! Master/worker reconciliation
//!
//! Masters: nothing found means bootstrap; the same set as the config means
//! already done; any other set is a topology conflict left to the operator.
//! Workers: every tagged worker is (re)installed, removals are only reported.

use super::{DeployError, DeployJob, DeployMode, Deployer, remote_install_cmd};
use crate::config::{AppConfig, ClusterConfig, NodeInfo};
use crate::fleet::RemoteFleet;
use crate::utils::print_step;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Maps a node name to its address
pub type NodeResolver = Box<dyn Fn(&ClusterConfig, &str) -> Option<String> + Send + Sync>;

pub struct Orchestrator<'a> {
    deployer: &'a dyn Deployer,
    fleet: Arc<dyn RemoteFleet>,
    app: AppConfig,
    resolver: NodeResolver,
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut names = names.to_vec();
    names.sort();
    names
}

impl<'a> Orchestrator<'a> {
    pub fn new(deployer: &'a dyn Deployer, fleet: Arc<dyn RemoteFleet>, app: AppConfig) -> Self {
        Self {
            deployer,
            fleet,
            app,
            resolver: Box::new(|conf: &ClusterConfig, name: &str| conf.node_ip(name)),
        }
    }

    pub fn with_resolver(mut self, resolver: NodeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn target_masters(&self, conf: &ClusterConfig) -> Vec<String> {
        conf.nodes_with_tag(&self.deployer.master_tag())
    }

    pub fn target_workers(&self, conf: &ClusterConfig) -> Vec<String> {
        conf.nodes_with_tag(&self.deployer.worker_tag())
    }

    /// Resolve names to addresses; a name the resolver does not know is fatal
    pub fn resolve(&self, conf: &ClusterConfig, names: &[String]) -> Result<Vec<NodeInfo>> {
        names
            .iter()
            .map(|name| match (self.resolver)(conf, name) {
                Some(ip) => Ok(NodeInfo {
                    name: name.clone(),
                    ip,
                }),
                None => Err(DeployError::NodeNotInConfig(name.clone()).into()),
            })
            .collect()
    }

    fn install_on(
        &self,
        conf: &ClusterConfig,
        nodes: &[NodeInfo],
        mode: DeployMode,
        ctx_b64: &str,
    ) -> Vec<String> {
        let hosts: Vec<String> = nodes.iter().map(|n| conf.host_for(&n.ip)).collect();
        let job = DeployJob {
            deployer: self.deployer.name(),
            mode,
        };
        let outputs = self.fleet.start_remote_cmds(
            &hosts,
            &remote_install_cmd(&self.app, &job, ctx_b64),
            &conf.global.ssh_passwd,
        );
        for (host, output) in hosts.iter().zip(&outputs) {
            println!();
            println!("host {} end with result: {}", host, output);
        }
        outputs
    }

    /// Full pass: masters, then workers unless the master layout conflicts
    pub fn setup_all(&self, conf: &ClusterConfig) -> Result<()> {
        let masters = self.target_masters(conf);

        print_step("DistributeDeploySetupAll", "setting up masters...");
        if let Err(err) = self.setup_masters(&masters, conf) {
            match err.downcast_ref::<DeployError>() {
                Some(DeployError::MastersAlreadySetup { existing }) => {
                    println!("⚠ masters already exist:");
                    for name in existing {
                        println!("  - {}", name);
                    }
                    if sorted(existing) != sorted(&masters) {
                        println!("✗ master distribution changed, fix manually");
                        return Err(err);
                    }
                }
                _ => {
                    println!("✗ setup master failed: {:#}", err);
                    return Err(err);
                }
            }
        }

        let workers = self.target_workers(conf);
        print_step("DistributeDeploySetupAll", "setting up workers...");
        self.setup_workers(&workers, conf)?;
        println!("✓ distribute deploy finished");
        Ok(())
    }

    /// Bootstrap masters when none exist.
    ///
    /// Returns `DeployError::MastersAlreadySetup` whenever masters were
    /// found, whether or not they match the target set; no install runs then.
    pub fn setup_masters(&self, targets: &[String], conf: &ClusterConfig) -> Result<()> {
        if targets.is_empty() {
            return Err(DeployError::NoTargetMasters.into());
        }
        let nodes = self.resolve(conf, targets)?;

        print_step("DistributeDeploySetupMaster", "checking master...");
        let existing: Vec<String> = self
            .deployer
            .check_master(conf)?
            .into_iter()
            .map(|n| n.name)
            .collect();
        debug!("existing masters: {:?}", existing);

        if !existing.is_empty() {
            let consistent = sorted(&existing) == sorted(targets);
            info!(consistent, "masters already set up");
            return Err(DeployError::MastersAlreadySetup { existing }.into());
        }

        println!("no master node found, start to create...");
        let ctx_b64 = self.deployer.prepare_master_setup_ctx_base64(&nodes, conf)?;
        println!("target nodes:");
        for node in &nodes {
            println!("  - {} ({})", node.name, node.ip);
        }

        print_step("DistributeDeploySetupMaster", "installing masters...");
        self.install_on(conf, &nodes, DeployMode::ThisMaster, &ctx_b64);
        Ok(())
    }

    /// Install every target worker; returns running workers that are no
    /// longer targeted (left untouched)
    pub fn setup_workers(
        &self,
        targets: &[String],
        conf: &ClusterConfig,
    ) -> Result<Vec<NodeInfo>> {
        print_step("DistributeDeploySetupWorker", "checking workers...");
        let existing = self.deployer.check_worker(conf)?;
        let nodes = self.resolve(conf, targets)?;
        let masters = self.resolve(conf, &self.target_masters(conf))?;

        print_step("DistributeDeploySetupWorker", "preparing worker setup context...");
        let ctx_b64 = self.deployer.prepare_worker_setup_ctx_base64(&masters, conf)?;

        if nodes.is_empty() {
            println!("no new worker to be created/updated");
        } else {
            println!("workers to be created/updated:");
            for node in &nodes {
                println!("  - {} ({})", node.name, node.ip);
            }
            print_step("DistributeDeploySetupWorker", "installing workers...");
            self.install_on(conf, &nodes, DeployMode::ThisWorker, &ctx_b64);
        }

        let removed: Vec<NodeInfo> = existing
            .into_iter()
            .filter(|node| !targets.contains(&node.name))
            .collect();
        if !removed.is_empty() {
            println!("⚠ Removing workers is not supported yet, workers to be removed:");
            for node in &removed {
                println!("  - {} ({})", node.name, node.ip);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::K3sDeployer;
    use crate::deploy::testing::ScriptedFleet;

    const CONF: &str = r#"
global:
  ssh_user: ubuntu
  ssh_passwd: pw
nodes:
  m1:
    ip: 10.0.0.1
    tags: [k3s_master]
  w1:
    ip: 10.0.0.2
    tags: [k3s_worker]
  w2:
    ip: 10.0.0.3
    tags: [k3s_worker]
"#;

    const MASTER_INSTALL: &str = "--mode distribute_deploy_this_master";
    const WORKER_INSTALL: &str = "--mode distribute_deploy_this_worker";

    fn app() -> AppConfig {
        AppConfig::from_lookup(|key| (key == "HOME").then(|| "/home/ops".to_string())).unwrap()
    }

    fn conf() -> ClusterConfig {
        ClusterConfig::parse(CONF).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Fleet answering like a cluster whose `kubectl get nodes` prints `masters`
    /// and `workers` as Ready
    fn cluster_fleet(
        masters: &'static [&'static str],
        workers: &'static [&'static str],
    ) -> Arc<ScriptedFleet<impl Fn(&str, &str) -> Option<String> + Send + Sync>> {
        Arc::new(ScriptedFleet::new(move |_: &str, cmd: &str| {
            if cmd.contains("get nodes") {
                let mut table = "NAME STATUS ROLES AGE VERSION\n".to_string();
                for m in masters {
                    table.push_str(&format!("{} Ready control-plane,master 1d v1\n", m));
                }
                if !cmd.contains("--selector") {
                    for w in workers {
                        table.push_str(&format!("{} Ready <none> 1d v1\n", w));
                    }
                }
                Some(table)
            } else if cmd.contains("server/token") {
                Some("K10token\n".to_string())
            } else {
                Some("installed\n".to_string())
            }
        }))
    }

    #[test]
    fn test_bootstrap_fresh_cluster() {
        let fleet = cluster_fleet(&[], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        orch.setup_all(&conf()).unwrap();

        let calls: Vec<(Vec<String>, String)> = fleet
            .calls()
            .into_iter()
            .filter(|(_, cmd)| !cmd.contains("get nodes"))
            .collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, names(&["ubuntu@10.0.0.1"]));
        assert!(calls[0].1.contains(MASTER_INSTALL));
        assert_eq!(calls[1].0, names(&["ubuntu@10.0.0.1"]));
        assert!(calls[1].1.contains("cat /var/lib/rancher/k3s/server/token"));
        assert_eq!(calls[2].0, names(&["ubuntu@10.0.0.2", "ubuntu@10.0.0.3"]));
        assert!(calls[2].1.contains(WORKER_INSTALL));
        assert!(calls[2].1.contains("--install-this-ctx "));
    }

    #[test]
    fn test_existing_master_skips_install_but_workers_proceed() {
        let fleet = cluster_fleet(&["m1"], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        orch.setup_all(&conf()).unwrap();
        assert!(fleet.calls_with(MASTER_INSTALL).is_empty());
        assert_eq!(fleet.calls_with(WORKER_INSTALL).len(), 1);
    }

    #[test]
    fn test_same_masters_any_order_is_already_setup() {
        let conf = ClusterConfig::parse(
            "global:\n  ssh_user: u\nnodes:\n  a:\n    ip: 1.1.1.1\n  b:\n    ip: 1.1.1.2\n",
        )
        .unwrap();
        let fleet = cluster_fleet(&["b", "a"], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        let err = orch.setup_masters(&names(&["a", "b"]), &conf).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>(),
            Some(&DeployError::MastersAlreadySetup {
                existing: names(&["b", "a"])
            })
        );
        assert!(fleet.calls_with(MASTER_INSTALL).is_empty());
    }

    #[test]
    fn test_master_conflict_aborts_without_install() {
        let conf = ClusterConfig::parse(
            "global:\n  ssh_user: u\nnodes:\n  a:\n    ip: 1.1.1.1\n  b:\n    ip: 1.1.1.2\n  c:\n    ip: 1.1.1.3\n    tags: [k3s_master]\n",
        )
        .unwrap();
        let fleet = cluster_fleet(&["a", "b"], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        let err = orch.setup_masters(&names(&["a", "c"]), &conf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MastersAlreadySetup { .. })
        ));
        assert!(fleet.calls_with(MASTER_INSTALL).is_empty());

        // setup_all stops before the worker phase
        assert!(orch.setup_all(&conf).is_err());
        assert!(fleet.calls_with("server/token").is_empty());
        assert!(fleet.calls_with(WORKER_INSTALL).is_empty());
    }

    #[test]
    fn test_no_target_masters() {
        let fleet = cluster_fleet(&[], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());
        let err = orch.setup_masters(&[], &conf()).unwrap_err();
        assert_eq!(err.downcast_ref::<DeployError>(), Some(&DeployError::NoTargetMasters));
        assert!(fleet.calls().is_empty());
    }

    #[test]
    fn test_workers_reinstalled_unconditionally() {
        let conf = ClusterConfig::parse(
            "global:\n  ssh_user: u\nnodes:\n  m:\n    ip: 1.1.1.9\n    tags: [k3s_master]\n  a:\n    ip: 1.1.1.1\n  b:\n    ip: 1.1.1.2\n",
        )
        .unwrap();
        let fleet = cluster_fleet(&["m"], &["a"]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        let removed = orch.setup_workers(&names(&["a", "b"]), &conf).unwrap();
        assert!(removed.is_empty());
        let installs = fleet.calls_with(WORKER_INSTALL);
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].0, names(&["u@1.1.1.1", "u@1.1.1.2"]));
    }

    #[test]
    fn test_untargeted_worker_is_only_reported() {
        let fleet = cluster_fleet(&["m1"], &["w1", "w2"]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        let removed = orch.setup_workers(&names(&["w1"]), &conf()).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "w2");
        let installs = fleet.calls_with(WORKER_INSTALL);
        assert_eq!(installs[0].0, names(&["ubuntu@10.0.0.2"]));
    }

    #[test]
    fn test_injected_resolver() {
        let fleet = cluster_fleet(&[], &[]);
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let resolver: NodeResolver = Box::new(|_: &ClusterConfig, name: &str| {
            (name != "w2").then(|| format!("192.168.0.{}", name.len()))
        });
        let orch = Orchestrator::new(&deployer, fleet.clone(), app()).with_resolver(resolver);

        let nodes = orch.resolve(&conf(), &names(&["m1"])).unwrap();
        assert_eq!(nodes[0].ip, "192.168.0.2");
        let err = orch.resolve(&conf(), &names(&["m1", "w2"])).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>(),
            Some(&DeployError::NodeNotInConfig("w2".to_string()))
        );
    }

    #[test]
    fn test_empty_token_stops_worker_phase() {
        let fleet = Arc::new(ScriptedFleet::new(|_: &str, cmd: &str| {
            (!cmd.contains("server/token")).then(String::new)
        }));
        let deployer = K3sDeployer::new(fleet.clone(), app());
        let orch = Orchestrator::new(&deployer, fleet.clone(), app());

        let err = orch.setup_workers(&names(&["w1", "w2"]), &conf()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EmptyJoinToken(_))
        ));
        assert!(fleet.calls_with(WORKER_INSTALL).is_empty());
    }
}
