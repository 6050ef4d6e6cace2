//! Helpers shared by the fleet engine and the deployers

pub mod bin;
pub mod exec;
pub mod network;
pub mod ssh;

pub use exec::LocalCmd;
pub use ssh::HostAddr;

/// Print a step banner for operator-facing progress
pub fn print_step(scope: &str, message: &str) {
    println!("[{}] {}", scope, message);
}
