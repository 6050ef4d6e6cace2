use crate::config::{AppConfig, ClusterConfig};
use crate::deploy::{DeployMode, Deployer, Orchestrator, new_deployer};
use crate::fleet::SshFleet;
use crate::utils::print_step;
use anyhow::{Context, Result, bail};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ask for the cluster config path; `None` when the operator cancels
pub fn prompt_config_path(
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<Option<PathBuf>> {
    writeln!(output, "Initial cluster setup needs a cluster config file (cluster_config.yml)")?;
    write!(output, "Path to yaml config (empty to cancel): ")?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let path = line.trim();
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(PathBuf::from(path)))
}

fn load_cluster_config(path: Option<&Path>) -> Result<ClusterConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let stdin = std::io::stdin();
            match prompt_config_path(&mut stdin.lock(), &mut std::io::stdout())? {
                Some(path) => path,
                None => bail!("User canceled config cluster"),
            }
        }
    };

    print_step("DistributeDeploySetupAll", "reading yaml file...");
    let conf = ClusterConfig::load(&path)?;
    println!("✓ Loaded cluster config with {} node(s)", conf.nodes.len());
    Ok(conf)
}

fn parse_mode(mode: &str) -> Result<DeployMode> {
    match DeployMode::parse(mode) {
        Some(mode) => Ok(mode),
        None => bail!("unsupported distribute deploy mode: '{}'", mode),
    }
}

/// On-node part: general install, then the master or worker part
pub fn install_this_node(
    deployer: &dyn Deployer,
    mode: DeployMode,
    install_ctx: Option<&str>,
) -> Result<()> {
    if mode == DeployMode::All {
        bail!("{} is not an on-node install mode", mode);
    }
    let ctx = install_ctx
        .filter(|c| !c.is_empty())
        .context("--install-this-ctx is required for on-node install")?;

    println!("installing general part for {}", deployer.name());
    deployer
        .this_node_general_install()
        .context("general part install failed")?;

    if mode == DeployMode::ThisMaster {
        println!("\ninstalling master part for {}", deployer.name());
        deployer
            .this_node_master_install(ctx)
            .context("master part install failed")?;
    } else {
        println!("\ninstalling worker part for {}", deployer.name());
        deployer
            .this_node_worker_install(ctx)
            .context("worker part install failed")?;
    }
    println!("✓ {} install finished", deployer.name());
    Ok(())
}

/// `kfleet distribute-deploy`: coordinator mode or on-node install mode
pub fn handle_distribute_deploy(
    deployer_name: &str,
    mode: &str,
    install_ctx: Option<&str>,
    config: Option<&Path>,
) -> Result<()> {
    let mode = parse_mode(mode)?;
    let app = AppConfig::load()?;
    let fleet = Arc::new(SshFleet::new(app.log_dir.clone()));
    let deployer = new_deployer(deployer_name, fleet.clone(), &app)?;

    match mode {
        DeployMode::All => {
            app.ensure_log_dir()?;
            let conf = load_cluster_config(config)?;
            Orchestrator::new(&*deployer, fleet, app).setup_all(&conf)
        }
        DeployMode::ThisMaster | DeployMode::ThisWorker => {
            install_this_node(&*deployer, mode, install_ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeInfo;
    use std::cell::RefCell;
    use std::io::Cursor;

    /// Records the on-node steps it was asked to run
    #[derive(Default)]
    struct StepDeployer {
        steps: RefCell<Vec<String>>,
        fail_general: bool,
    }

    impl Deployer for StepDeployer {
        fn name(&self) -> &str {
            "stub"
        }

        fn check_master(&self, _conf: &ClusterConfig) -> Result<Vec<NodeInfo>> {
            Ok(Vec::new())
        }

        fn check_worker(&self, _conf: &ClusterConfig) -> Result<Vec<NodeInfo>> {
            Ok(Vec::new())
        }

        fn prepare_worker_setup_ctx_base64(
            &self,
            _masters: &[NodeInfo],
            _conf: &ClusterConfig,
        ) -> Result<String> {
            Ok(String::new())
        }

        fn prepare_master_setup_ctx_base64(
            &self,
            _masters: &[NodeInfo],
            _conf: &ClusterConfig,
        ) -> Result<String> {
            Ok(String::new())
        }

        fn this_node_general_install(&self) -> Result<()> {
            self.steps.borrow_mut().push("general".to_string());
            if self.fail_general {
                bail!("no k3s binary");
            }
            Ok(())
        }

        fn this_node_master_install(&self, ctx_b64: &str) -> Result<()> {
            self.steps.borrow_mut().push(format!("master {}", ctx_b64));
            Ok(())
        }

        fn this_node_worker_install(&self, ctx_b64: &str) -> Result<()> {
            self.steps.borrow_mut().push(format!("worker {}", ctx_b64));
            Ok(())
        }
    }

    #[test]
    fn test_missing_ctx_fails_before_any_install_step() {
        let deployer = StepDeployer::default();
        for ctx in [None, Some("")] {
            let err = install_this_node(&deployer, DeployMode::ThisWorker, ctx).unwrap_err();
            assert!(err.to_string().contains("--install-this-ctx"));
        }
        assert!(install_this_node(&deployer, DeployMode::ThisMaster, None).is_err());
        assert!(deployer.steps.borrow().is_empty());
    }

    #[test]
    fn test_on_node_modes_run_general_then_role_part() {
        let deployer = StepDeployer::default();
        install_this_node(&deployer, DeployMode::ThisMaster, Some("e30=")).unwrap();
        install_this_node(&deployer, DeployMode::ThisWorker, Some("eyJ0")).unwrap();
        assert_eq!(
            *deployer.steps.borrow(),
            vec!["general", "master e30=", "general", "worker eyJ0"]
        );
    }

    #[test]
    fn test_general_failure_stops_role_part() {
        let deployer = StepDeployer {
            fail_general: true,
            ..Default::default()
        };
        let err = install_this_node(&deployer, DeployMode::ThisWorker, Some("e30=")).unwrap_err();
        assert_eq!(err.to_string(), "general part install failed");
        assert_eq!(*deployer.steps.borrow(), vec!["general"]);
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(parse_mode("distribute_deploy_all").unwrap(), DeployMode::All);
        let err = parse_mode("distribute_deploy_everything").unwrap_err();
        assert!(err.to_string().contains("unsupported distribute deploy mode"));

        let deployer = StepDeployer::default();
        assert!(install_this_node(&deployer, DeployMode::All, Some("e30=")).is_err());
        assert!(deployer.steps.borrow().is_empty());
    }

    #[test]
    fn test_unknown_mode_rejected_before_setup() {
        let err = handle_distribute_deploy("k3s", "this_master", Some("e30="), None).unwrap_err();
        assert!(err.to_string().contains("unsupported distribute deploy mode"));
    }

    #[test]
    fn test_prompt_config_path() {
        let mut out = Vec::new();
        let path = prompt_config_path(&mut Cursor::new("  ./cluster.yml \n"), &mut out).unwrap();
        assert_eq!(path, Some(PathBuf::from("./cluster.yml")));
        assert!(String::from_utf8(out).unwrap().contains("cluster_config.yml"));
    }

    #[test]
    fn test_prompt_cancel() {
        let mut out = Vec::new();
        assert_eq!(prompt_config_path(&mut Cursor::new("\n"), &mut out).unwrap(), None);
        assert_eq!(prompt_config_path(&mut Cursor::new(""), &mut out).unwrap(), None);
    }

    #[test]
    fn test_load_cluster_config_from_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.yml");
        std::fs::write(
            &path,
            "global:\n  ssh_user: ubuntu\nnodes:\n  m1:\n    ip: 10.0.0.1\n    tags: [k3s_master]\n",
        )
        .unwrap();
        let conf = load_cluster_config(Some(path.as_path())).unwrap();
        assert_eq!(conf.nodes_with_tag("k3s_master"), vec!["m1".to_string()]);
        assert!(load_cluster_config(Some(dir.path().join("missing.yml").as_path())).is_err());
    }
}
