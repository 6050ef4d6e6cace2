use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Local command builder used by the on-node install steps
#[derive(Debug, Clone)]
pub struct LocalCmd {
    program: String,
    args: Vec<String>,
    root: bool,
    envs: Vec<(String, String)>,
    dir: Option<PathBuf>,
    show_progress: bool,
}

impl LocalCmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            root: false,
            envs: Vec::new(),
            dir: None,
            show_progress: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run through `sudo` unless already root
    pub fn with_root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Stream output to the terminal instead of capturing it
    pub fn show_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    /// Human-readable command line, env included
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .envs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = if self.root && !is_root() {
            // sudo resets the environment, so pass it through env(1)
            let mut cmd = Command::new("sudo");
            if !self.envs.is_empty() {
                cmd.arg("env");
                cmd.args(self.envs.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
            cmd.arg(&self.program);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
            cmd
        };
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion; returns captured stdout (empty with `show_progress`)
    pub fn block_run(&self) -> Result<String> {
        debug!("running local command: {}", self.describe());
        let mut cmd = self.build();

        if self.show_progress {
            let status = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .with_context(|| format!("Failed to execute command: {}", self.program))?;
            if !status.success() {
                anyhow::bail!(
                    "Command '{}' failed with exit code: {}",
                    self.describe(),
                    status.code().unwrap_or(1)
                );
            }
            return Ok(String::new());
        }

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute command: {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "Command '{}' failed with exit code {}: {}",
                self.describe(),
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Where on-node install steps get executed
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &LocalCmd) -> Result<String>;
}

/// Runs commands on this machine
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &LocalCmd) -> Result<String> {
        cmd.block_run()
    }
}
