//! Local binary provisioning

use crate::config::AppConfig;
use crate::utils::exec::LocalCmd;
use crate::utils::network::{current_arch, download_file};
use crate::utils::print_step;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Make sure `name` is on PATH; otherwise fetch it from `url` into `/usr/bin`.
/// Returns where the binary lives.
pub fn make_sure_with(name: &str, url: &str) -> Result<PathBuf> {
    print_step("make sure with bin", &format!("checking {}", name));
    if let Ok(path) = which::which(name) {
        println!("✓ {} already installed at {}", name, path.display());
        return Ok(path);
    }

    print_step("make sure with bin", &format!("installing {}", name));
    let tmp_path = std::env::temp_dir()
        .join(format!("kfleet_bin_{}", name))
        .join(name);
    download_file(url, &tmp_path)?;

    let target = format!("/usr/bin/{}", name);
    LocalCmd::new("mv")
        .arg(tmp_path.to_string_lossy())
        .arg(&target)
        .with_root()
        .block_run()
        .with_context(|| format!("Failed to install {} to {}", name, target))?;
    LocalCmd::new("chmod")
        .args(["755", target.as_str()])
        .with_root()
        .block_run()
        .with_context(|| format!("Failed to chmod {}", target))?;

    println!("✓ {} installed", name);
    Ok(PathBuf::from(target))
}

/// `k3s` for this machine's arch, served by the main node's file server
pub fn ensure_k3s_binary(app: &AppConfig) -> Result<PathBuf> {
    let url = format!("{}/bin_k3s/k3s-{}", app.file_server_url(), current_arch());
    make_sure_with("k3s", &url)
}
