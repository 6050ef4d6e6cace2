//! Remote OS and architecture probes built on the fleet engine

use super::RemoteFleet;
use crate::utils::network::{ARCH_AMD64, ARCH_ARM64, normalize_arch};

pub const SYS_LINUX: &str = "linux";
pub const SYS_DARWIN: &str = "darwin";
pub const SYS_WINDOWS: &str = "windows";
pub const UNKNOWN: &str = "unknown";

/// Classify `uname -s` output
pub fn parse_sys(output: &str) -> &'static str {
    let out = output.trim().to_lowercase();
    if out.contains("linux") {
        SYS_LINUX
    } else if out.contains("darwin") {
        SYS_DARWIN
    } else if out.contains("mingw") || out.contains("msys") || out.contains("cygwin") || out.contains("windows") {
        SYS_WINDOWS
    } else {
        UNKNOWN
    }
}

/// Classify `uname -m` output
pub fn parse_arch(output: &str) -> &'static str {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(normalize_arch)
        .unwrap_or(UNKNOWN)
}

/// Operating system of every host, aligned with `hosts`
pub fn remote_sys(fleet: &dyn RemoteFleet, hosts: &[String], password: &str) -> Vec<&'static str> {
    fleet
        .start_remote_cmds(hosts, "uname -s", password)
        .iter()
        .map(|out| parse_sys(out))
        .collect()
}

/// CPU architecture of every host, aligned with `hosts`
pub fn remote_arch(fleet: &dyn RemoteFleet, hosts: &[String], password: &str) -> Vec<&'static str> {
    fleet
        .start_remote_cmds(hosts, "uname -m", password)
        .iter()
        .map(|out| parse_arch(out))
        .collect()
}

/// True when every probed arch is one we ship binaries for
pub fn all_supported(arches: &[&str]) -> bool {
    arches.iter().all(|a| *a == ARCH_AMD64 || *a == ARCH_ARM64)
}
