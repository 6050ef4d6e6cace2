use crate::config::AppConfig;
use crate::fleet::probe::{all_supported, remote_arch, remote_sys};
use crate::fleet::{RemoteFleet, SshFleet};
use anyhow::{Result, bail};

fn fleet() -> Result<SshFleet> {
    let app = AppConfig::load()?;
    Ok(SshFleet::new(app.ensure_log_dir()?))
}

/// Run an ad-hoc command on every host and print each transcript
pub fn handle_remote_cmd(hosts: &[String], password: &str, command: &[String]) -> Result<()> {
    if command.is_empty() {
        bail!("No command given; usage: kfleet remote-cmd --host user@ip -- <command>");
    }
    let command = command.join(" ");
    let report = fleet()?.run(hosts, &command, password);

    for (i, host) in hosts.iter().enumerate() {
        println!();
        match report.exit_codes[i] {
            Some(0) => println!("✓ {} finished", host),
            Some(code) => println!("⚠ {} exited with status {}", host, code),
            None => println!("✗ {} failed, see {}", host, report.log_paths[i].display()),
        }
        print!("{}", report.outputs[i]);
    }
    Ok(())
}

pub fn handle_remote_sys(hosts: &[String], password: &str) -> Result<()> {
    let fleet = fleet()?;
    for (host, sys) in hosts.iter().zip(remote_sys(&fleet, hosts, password)) {
        println!("{}: {}", host, sys);
    }
    Ok(())
}

pub fn handle_remote_arch(hosts: &[String], password: &str) -> Result<()> {
    let fleet = fleet()?;
    let arches = remote_arch(&fleet, hosts, password);
    for (host, arch) in hosts.iter().zip(&arches) {
        println!("{}: {}", host, arch);
    }
    if !all_supported(&arches) {
        println!("⚠ Some hosts are unreachable or use an architecture without k3s binaries");
    }
    Ok(())
}
