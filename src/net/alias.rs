//! Loopback aliases for tunnel addresses
//!
//! The OS has to accept connections on a tunnel address before anything can
//! be bound to it, so each address is aliased onto the loopback interface
//! while its tunnel is active.

use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Adds and removes locally-routable loopback addresses.
///
/// Both operations must be idempotent: aliasing a present address or
/// unaliasing a missing one succeeds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressAliaser: Send + Sync {
    async fn alias(&self, ip: Ipv4Addr) -> Result<()>;
    async fn unalias(&self, ip: Ipv4Addr) -> Result<()>;
}

/// Aliaser backed by the platform network tooling
#[derive(Debug, Clone, Default)]
pub struct SystemAliaser;

impl SystemAliaser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AddressAliaser for SystemAliaser {
    async fn alias(&self, ip: Ipv4Addr) -> Result<()> {
        let (program, args) = alias_command(ip);
        run(program, &args, "alias", ip).await?;
        info!(address = %ip, "Aliased loopback address");
        Ok(())
    }

    async fn unalias(&self, ip: Ipv4Addr) -> Result<()> {
        let (program, args) = unalias_command(ip);
        run(program, &args, "unalias", ip).await?;
        info!(address = %ip, "Removed loopback alias");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn alias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    (
        "ip",
        vec!["addr".into(), "add".into(), format!("{}/32", ip), "dev".into(), "lo".into()],
    )
}

#[cfg(target_os = "linux")]
fn unalias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    (
        "ip",
        vec!["addr".into(), "del".into(), format!("{}/32", ip), "dev".into(), "lo".into()],
    )
}

#[cfg(target_os = "windows")]
fn alias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    (
        "netsh",
        vec![
            "interface".into(),
            "ipv4".into(),
            "add".into(),
            "address".into(),
            "Loopback".into(),
            ip.to_string(),
            "255.255.255.255".into(),
        ],
    )
}

#[cfg(target_os = "windows")]
fn unalias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    (
        "netsh",
        vec![
            "interface".into(),
            "ipv4".into(),
            "delete".into(),
            "address".into(),
            "Loopback".into(),
            ip.to_string(),
        ],
    )
}

// macOS and the BSDs
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn alias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    ("ifconfig", vec!["lo0".into(), "alias".into(), ip.to_string()])
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn unalias_command(ip: Ipv4Addr) -> (&'static str, Vec<String>) {
    ("ifconfig", vec!["lo0".into(), "-alias".into(), ip.to_string()])
}

async fn run(program: &str, args: &[String], action: &'static str, ip: Ipv4Addr) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Alias {
            action,
            address: ip,
            message: format!("failed to execute {}: {}", program, e),
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_done(action, &stderr) {
        debug!(address = %ip, action, "Alias already in requested state");
        return Ok(());
    }

    Err(Error::Alias {
        action,
        address: ip,
        message: stderr.trim().to_string(),
    })
}

/// Recognize the tooling's complaints about a no-op request
fn is_already_done(action: &str, stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    match action {
        "alias" => stderr.contains("file exists") || stderr.contains("already exists"),
        _ => {
            stderr.contains("cannot assign requested address")
                || stderr.contains("can't assign requested address")
                || stderr.contains("element not found")
        }
    }
}
