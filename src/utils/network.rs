use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

pub const ARCH_AMD64: &str = "amd64";
pub const ARCH_ARM64: &str = "arm64";

/// Download `url` into `dest`, creating parent directories
pub fn download_file(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(600))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;

    println!("Downloading {} to {}", url, dest.display());
    let bytes = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Download failed: {}", url))?
        .bytes()
        .with_context(|| format!("Failed to read response body from {}", url))?;

    let mut file = std::fs::File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    file.write_all(&bytes)
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    println!("✓ Downloaded {} bytes", bytes.len());
    Ok(())
}

/// Architecture label used by the file server; unknown falls back to amd64
pub fn current_arch() -> &'static str {
    normalize_arch(std::env::consts::ARCH).unwrap_or(ARCH_AMD64)
}

/// Map `uname -m` style names onto the file server labels
pub fn normalize_arch(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => Some(ARCH_AMD64),
        "aarch64" | "arm64" | "arm64e" => Some(ARCH_ARM64),
        _ => None,
    }
}
