//! kfleet library
//!
//! Fleet SSH execution and distributed cluster bootstrap

pub mod commands;
pub mod config;
pub mod deploy;
pub mod fleet;
pub mod utils;

pub use config::{AppConfig, ClusterConfig, NodeInfo};
pub use deploy::{DeployError, Deployer, new_deployer};
pub use fleet::{FleetReport, RemoteFleet, SshFleet};
