//! Fleet command execution engine
//!
//! Runs one command on many SSH hosts in parallel. Every host gets its own
//! worker thread; workers only talk to the caller through a single channel
//! of `NodeMsg`. The calling thread is the sole owner of the per-host state
//! and the console view, and returns once every host reported completion.
//! There is no overall timeout: a hung remote command blocks the call.
//!
//! When a password is given, each host first gets passwordless sudo for the
//! login user (see `prepare_sudo`), since on-node installs run `sudo` without
//! a terminal.

pub mod probe;
pub mod transcript;
mod view;

pub use view::{FleetView, render_line};

use crate::utils::ssh::{HostAddr, ssh_session};
use anyhow::{Context, Result};
use ssh2::ExtendedData;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-host state shown in the console view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub host: String,
    pub output: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// One output line, in the order the remote process produced it
    Line(String),
    /// The command ran to completion; its output starts at byte
    /// `output_start` of the transcript at `log_path`
    Done {
        log_path: PathBuf,
        output_start: u64,
        exit_code: Option<i32>,
    },
    /// The host could not run the command (bad address, dial, auth, start)
    Failed(String),
}

/// Progress unit from one host worker, addressed by host index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMsg {
    pub index: usize,
    pub event: NodeEvent,
}

impl NodeMsg {
    pub fn is_final(&self) -> bool {
        !matches!(self.event, NodeEvent::Line(_))
    }
}

/// Result of one fleet call, aligned with the host list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    /// Transcript minus header; empty means unknown or failed
    pub outputs: Vec<String>,
    pub log_paths: Vec<PathBuf>,
    /// Remote exit status for hosts whose command ran to completion
    pub exit_codes: Vec<Option<i32>>,
}

impl FleetReport {
    pub fn succeeded(&self, index: usize) -> bool {
        matches!(self.exit_codes.get(index), Some(Some(0)))
    }
}

/// Something that can run one command across a set of hosts
pub trait RemoteFleet: Send + Sync {
    fn run(&self, hosts: &[String], command: &str, password: &str) -> FleetReport;

    /// Final per-host outputs in host order
    fn start_remote_cmds(&self, hosts: &[String], command: &str, password: &str) -> Vec<String> {
        self.run(hosts, command, password).outputs
    }
}

/// Connect to one host, run `command` with `input` on its stdin, feed each
/// merged output line to `on_line`, and return the exit status
pub trait HostRunner: Send + Sync {
    fn run(
        &self,
        addr: &HostAddr,
        command: &str,
        password: &str,
        input: Option<&str>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32>;
}

/// libssh2-backed host runner
pub struct Ssh2Runner;

impl HostRunner for Ssh2Runner {
    fn run(
        &self,
        addr: &HostAddr,
        command: &str,
        password: &str,
        input: Option<&str>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let (_session, mut channel) = ssh_session(addr, password)?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .context("Failed to merge stderr into stdout")?;
        channel
            .exec(command)
            .context("Error starting command")?;
        if let Some(input) = input {
            channel
                .write_all(input.as_bytes())
                .context("Failed to write command input")?;
        }
        channel.send_eof().context("Failed to close command input")?;

        {
            let mut reader = BufReader::new(&mut channel);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = reader
                    .read_until(b'\n', &mut buf)
                    .context("Failed to read command output")?;
                if read == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
        }

        channel
            .wait_close()
            .context("Failed waiting for command to finish")?;
        channel.exit_status().context("Failed to read exit status")
    }
}

/// The SSH fleet engine
pub struct SshFleet {
    log_dir: PathBuf,
    runner: Arc<dyn HostRunner>,
}

impl SshFleet {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(log_dir, Arc::new(Ssh2Runner))
    }

    pub fn with_runner(log_dir: impl Into<PathBuf>, runner: Arc<dyn HostRunner>) -> Self {
        Self {
            log_dir: log_dir.into(),
            runner,
        }
    }
}

impl RemoteFleet for SshFleet {
    fn run(&self, hosts: &[String], command: &str, password: &str) -> FleetReport {
        println!();
        debug!("Starting remote command: {}", command);

        let timestamp = transcript::run_timestamp();
        let log_paths: Vec<PathBuf> = hosts
            .iter()
            .map(|host| transcript::allocate_log_path(&self.log_dir, host, &timestamp))
            .collect();

        let mut collector = Collector::new(hosts, log_paths.clone());
        if hosts.is_empty() {
            return collector.into_report();
        }

        let (tx, rx) = mpsc::channel::<NodeMsg>();
        let mut workers = Vec::with_capacity(hosts.len());
        for (index, (host, log_path)) in hosts.iter().zip(log_paths).enumerate() {
            let tx = tx.clone();
            let runner = Arc::clone(&self.runner);
            let host = host.clone();
            let command = command.to_string();
            let password = password.to_string();
            workers.push(thread::spawn(move || {
                run_host(runner.as_ref(), index, &host, &log_path, &command, &password, &tx);
            }));
        }
        // The channel disconnects once every worker has dropped its sender
        drop(tx);

        let mut view = FleetView::new(&collector.states);
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(msg) => {
                    let is_final = msg.is_final();
                    let index = collector.apply(msg);
                    if let Some(state) = collector.states.get(index) {
                        view.update(index, state);
                    }
                    if is_final && collector.all_complete() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => view.poll_quit(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(view);

        for worker in workers {
            if worker.join().is_err() {
                warn!("remote command worker panicked");
            }
        }

        collector.into_report()
    }
}

/// Worker body for one host; every exit path sends exactly one final message
fn run_host(
    runner: &dyn HostRunner,
    index: usize,
    host: &str,
    log_path: &Path,
    command: &str,
    password: &str,
    tx: &Sender<NodeMsg>,
) {
    let send = |event: NodeEvent| {
        tx.send(NodeMsg { index, event }).ok();
    };

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(e) => {
            send(NodeEvent::Failed(format!("Error opening log file: {}", e)));
            return;
        }
    };
    if let Err(e) = transcript::write_header(&mut file, host, command) {
        send(NodeEvent::Failed(format!("Error writing log file: {}", e)));
        return;
    }

    let addr = match HostAddr::parse(host) {
        Ok(addr) => addr,
        Err(e) => {
            writeln!(file, "Error: {:#}", e).ok();
            send(NodeEvent::Failed(format!("Error: {:#}", e)));
            return;
        }
    };

    if !password.is_empty() {
        if let Err(e) = prepare_sudo(runner, &addr, password, &mut file, &send) {
            warn!("sudo setup on {} failed: {:#}", host, e);
            writeln!(file, "Error sudo: {:#}", e).ok();
        }
    }

    file.flush().ok();
    let output_start = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(e) => {
            send(NodeEvent::Failed(format!("Error reading log file: {}", e)));
            return;
        }
    };

    send(NodeEvent::Line(format!("executing command on {}", host)));
    let result = runner.run(&addr, command, password, None, &mut |line: &str| {
        send(NodeEvent::Line(line.to_string()));
        writeln!(file, "{}", line).ok();
    });

    match result {
        Ok(exit_code) => {
            file.flush().ok();
            send(NodeEvent::Done {
                log_path: log_path.to_path_buf(),
                output_start,
                exit_code: Some(exit_code),
            });
        }
        Err(e) => {
            writeln!(file, "Error ssh: {:#}", e).ok();
            send(NodeEvent::Failed(format!("Error ssh: {:#}", e)));
        }
    }
}

const SUDO_CHECK_CMD: &str =
    "if sudo -n true 2>/dev/null; then echo 'sudo_ok'; else echo 'sudo_need_config'; fi";
const SUDO_VERIFY_CMD: &str = "sudo -n true";

/// Installs a NOPASSWD drop-in for `user`; the password arrives on stdin
fn sudoers_cmd(user: &str) -> String {
    format!(
        "sudo -S -p '' sh -c 'echo \"{user} ALL=(ALL) NOPASSWD:ALL\" > /etc/sudoers.d/{user} && chmod 440 /etc/sudoers.d/{user}'"
    )
}

/// Run one preparation command to completion and collect its output
fn sudo_step(
    runner: &dyn HostRunner,
    addr: &HostAddr,
    command: &str,
    password: &str,
    input: Option<&str>,
) -> Result<String> {
    let mut output = String::new();
    let code = runner.run(addr, command, password, input, &mut |line: &str| {
        output.push_str(line);
        output.push('\n');
    })?;
    if code != 0 {
        anyhow::bail!("exit status {}: {}", code, output.trim());
    }
    Ok(output)
}

/// Check `sudo -n`; if it needs a password, feed `password` to `sudo -S`
/// to install a NOPASSWD entry, then verify it took effect
fn prepare_sudo(
    runner: &dyn HostRunner,
    addr: &HostAddr,
    password: &str,
    file: &mut File,
    send: &dyn Fn(NodeEvent),
) -> Result<()> {
    send(NodeEvent::Line(format!("checking sudo permissions for {}", addr.server)));
    let output = sudo_step(runner, addr, SUDO_CHECK_CMD, password, None)
        .context("Failed to check sudo permissions")?;
    writeln!(file, "Checking sudo permissions output: {}", output.trim())?;
    if !output.contains("sudo_need_config") {
        return Ok(());
    }

    send(NodeEvent::Line(format!("configuring sudo for {}", addr.server)));
    let input = format!("{}\n", password);
    let sudoers = sudoers_cmd(&addr.user);
    let output = sudo_step(runner, addr, &sudoers, password, Some(input.as_str()))
        .context("Failed to configure sudo")?;
    writeln!(file, "Configuring sudo output: {}", output.trim())?;

    send(NodeEvent::Line(format!("verifying sudo config for {}", addr.server)));
    let output = sudo_step(runner, addr, SUDO_VERIFY_CMD, password, None)
        .context("sudo still asks for a password")?;
    writeln!(file, "Verifying sudo config output: {}", output.trim())?;
    debug!("passwordless sudo configured for {}@{}", addr.user, addr.server);
    Ok(())
}

/// Owner of per-host state during one fleet call
struct Collector {
    states: Vec<NodeState>,
    report: FleetReport,
}

impl Collector {
    fn new(hosts: &[String], log_paths: Vec<PathBuf>) -> Self {
        Self {
            states: hosts
                .iter()
                .map(|host| NodeState {
                    host: host.clone(),
                    ..Default::default()
                })
                .collect(),
            report: FleetReport {
                outputs: vec![String::new(); hosts.len()],
                log_paths,
                exit_codes: vec![None; hosts.len()],
            },
        }
    }

    fn apply(&mut self, msg: NodeMsg) -> usize {
        let index = msg.index;
        let Some(state) = self.states.get_mut(index) else {
            warn!("Progress for unknown host index {}", index);
            return index;
        };

        match msg.event {
            NodeEvent::Line(line) => {
                state.output = line;
            }
            NodeEvent::Done {
                log_path,
                output_start,
                exit_code,
            } => {
                state.is_complete = true;
                state.output = format!("Done with {}", log_path.display());
                self.report.exit_codes[index] = exit_code;
                match transcript::read_output(&log_path, output_start) {
                    Ok(output) => self.report.outputs[index] = output,
                    Err(e) => warn!("{:#}", e),
                }
            }
            NodeEvent::Failed(text) => {
                warn!("Remote run maybe failed on {}: {}", state.host, text);
                state.is_complete = true;
                state.output = text;
            }
        }
        index
    }

    fn all_complete(&self) -> bool {
        self.states.iter().all(|state| state.is_complete)
    }

    fn into_report(self) -> FleetReport {
        self.report
    }
}
