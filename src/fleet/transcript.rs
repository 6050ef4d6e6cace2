//! Per-host transcript files
//!
//! Each host writes a two-line header, then any sudo preparation notes, then
//! every output line of the command. The output handed back to callers starts
//! at the offset where the command's own lines begin.

use anyhow::{Context, Result};
use rand::Rng;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub fn run_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `remote_cmd_<user>_<host>_<timestamp>_<tag>.log`
pub fn log_file_name(host: &str, timestamp: &str, tag: u32) -> String {
    format!(
        "remote_cmd_{}_{}_{}.log",
        host.replace('@', "_"),
        timestamp,
        tag
    )
}

/// Pick a log path in `dir` that does not exist yet
pub fn allocate_log_path(dir: &Path, host: &str, timestamp: &str) -> PathBuf {
    let mut rng = rand::thread_rng();
    loop {
        let path = dir.join(log_file_name(host, timestamp, rng.gen_range(0..10000)));
        if !path.exists() {
            return path;
        }
    }
}

/// Header written before any output; always exactly two lines
pub fn write_header(out: &mut impl Write, host: &str, command: &str) -> std::io::Result<()> {
    let command = command.replace(['\r', '\n'], " ");
    write!(out, "Running command on host {}:\n  {}\n", host, command)
}

/// Read a finished transcript from `output_start` on
pub fn read_output(path: &Path, output_start: u64) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Error reading log file({})", path.display()))?;
    file.seek(SeekFrom::Start(output_start))
        .with_context(|| format!("Error reading log file({})", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("Error reading log file({})", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
