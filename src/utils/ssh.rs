//! SSH connection layer
//!
//! Opens an authenticated libssh2 session to one host. Host keys are not
//! verified; hosts are trusted at the network level.

use anyhow::{Context, Result};
use ssh2::{Channel, Session};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// `user@server[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub user: String,
    pub server: String,
    pub port: u16,
}

impl HostAddr {
    pub fn parse(host: &str) -> Result<Self> {
        let parts: Vec<&str> = host.split('@').collect();
        if parts.len() != 2 {
            anyhow::bail!("Invalid host format: {}", host);
        }
        let (server, port) = match parts[1].split_once(':') {
            Some((server, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in host: {}", host))?;
                (server, port)
            }
            None => (parts[1], DEFAULT_SSH_PORT),
        };

        Ok(Self {
            user: parts[0].to_string(),
            server: server.to_string(),
            port,
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Private key candidates under `dir`: any file named `*id_*` that is not a `.pub`
pub fn find_private_keys(dir: &Path) -> Vec<PathBuf> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let Ok(paths) = glob::glob(&pattern) else {
        return Vec::new();
    };

    paths
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|name| {
                    let name = name.to_string_lossy();
                    name.contains("id_") && !name.ends_with(".pub")
                })
                .unwrap_or(false)
        })
        .collect()
}

/// `~/.ssh` of the local user
pub fn ssh_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ssh")
}

fn handshake(addr: &HostAddr) -> Result<Session> {
    let tcp = TcpStream::connect(addr.socket_addr())
        .with_context(|| format!("Failed to connect to {}", addr.socket_addr()))?;
    let mut session = Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;
    Ok(session)
}

fn session_with_key(addr: &HostAddr, key_path: &Path) -> Result<Session> {
    let session = handshake(addr)?;
    session
        .userauth_pubkey_file(&addr.user, None, key_path, None)
        .with_context(|| format!("Key authentication failed with {}", key_path.display()))?;
    if !session.authenticated() {
        anyhow::bail!("Key authentication failed with {}", key_path.display());
    }
    Ok(session)
}

fn session_with_password(addr: &HostAddr, password: &str) -> Result<Session> {
    let session = handshake(addr)?;
    session
        .userauth_password(&addr.user, password)
        .context("Password authentication failed")?;
    if !session.authenticated() {
        anyhow::bail!("Password authentication failed");
    }
    Ok(session)
}

/// Probe whether `key_path` authenticates against `addr`; the connection is dropped
pub fn try_key(addr: &HostAddr, key_path: &Path) -> bool {
    match session_with_key(addr, key_path) {
        Ok(session) => {
            session.disconnect(None, "key probe", None).ok();
            true
        }
        Err(e) => {
            debug!("key {} rejected by {}: {:#}", key_path.display(), addr.socket_addr(), e);
            false
        }
    }
}

/// Open an authenticated session and an unstarted channel on it.
///
/// With a non-empty `password`, password auth is used directly. Otherwise
/// every key found under `~/.ssh` is probed and the first one that
/// authenticates opens the real session. The caller runs exactly one command
/// on the returned channel.
pub fn ssh_session(addr: &HostAddr, password: &str) -> Result<(Session, Channel)> {
    let session = if !password.is_empty() {
        session_with_password(addr, password)?
    } else {
        let dir = ssh_dir();
        let keys = find_private_keys(&dir);
        if keys.is_empty() {
            anyhow::bail!("No private key files found under {}", dir.display());
        }

        let key = keys
            .iter()
            .find(|key| try_key(addr, key))
            .with_context(|| {
                format!(
                    "None of the {} keys under {} authenticate {}@{}",
                    keys.len(),
                    dir.display(),
                    addr.user,
                    addr.socket_addr()
                )
            })?;
        session_with_key(addr, key)?
    };

    let channel = session
        .channel_session()
        .context("Failed to open SSH channel")?;
    Ok((session, channel))
}
