//! Command routing
//!
//! Every subcommand lives in its own file here; add the variant to `Commands`
//! and the match arm to `handle_command`.

pub mod distribute_deploy;
pub mod remote;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap a cluster, or install one role on this node
    DistributeDeploy {
        /// Deployer name (e.g. k3s)
        #[arg(long)]
        deployer: String,
        /// distribute_deploy_all | distribute_deploy_this_master | distribute_deploy_this_worker
        #[arg(long)]
        mode: String,
        /// Base64 JSON setup context for on-node installs
        #[arg(long = "install-this-ctx")]
        install_this_ctx: Option<String>,
        /// Cluster config yaml (prompted for when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a command on one or more hosts in parallel
    RemoteCmd {
        /// Target host as user@ip[:port]; repeatable
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
        /// SSH password (keys under ~/.ssh are probed when empty)
        #[arg(long, default_value = "")]
        password: String,
        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the operating system of each host
    RemoteSys {
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
        #[arg(long, default_value = "")]
        password: String,
    },
    /// Print the CPU architecture of each host
    RemoteArch {
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
        #[arg(long, default_value = "")]
        password: String,
    },
}

/// Dispatch command to appropriate handler
pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::DistributeDeploy {
            deployer,
            mode,
            install_this_ctx,
            config,
        } => distribute_deploy::handle_distribute_deploy(
            &deployer,
            &mode,
            install_this_ctx.as_deref(),
            config.as_deref(),
        ),
        Commands::RemoteCmd {
            hosts,
            password,
            command,
        } => remote::handle_remote_cmd(&hosts, &password, &command),
        Commands::RemoteSys { hosts, password } => remote::handle_remote_sys(&hosts, &password),
        Commands::RemoteArch { hosts, password } => remote::handle_remote_arch(&hosts, &password),
    }
}
