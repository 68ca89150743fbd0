//! Platform-specific network snapshot and cleanup
//!
//! Tearing down a VPN can leave the host with a dead tunnel device, stale
//! routes and the VPN's DNS servers. Before each connect the daemon captures
//! a [`NetworkSnapshot`] of the pre-VPN network; the cleanup steps use it to
//! put things back.

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Pre-VPN network configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub default_interface: String,
    pub wifi_service_name: String,
    pub dns_servers: Vec<String>,
    pub default_gateway: String,
    pub tunnel_interface: String,
}

type StepAction = Box<dyn FnOnce() -> Result<(), PlatformError> + Send>;

/// One cleanup action with a human-readable name and the command it runs
pub struct CleanupStep {
    pub name: String,
    pub command: String,
    action: StepAction,
}

impl CleanupStep {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        action: impl FnOnce() -> Result<(), PlatformError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            action: Box::new(action),
        }
    }

    /// Lines shown before the step runs
    pub fn intro_lines(&self) -> [String; 2] {
        [format!("{}...", self.name), format!("$ {}", self.command)]
    }

    pub fn run(self) -> Result<(), PlatformError> {
        (self.action)()
    }
}

impl std::fmt::Debug for CleanupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStep")
            .field("name", &self.name)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Line reporting how a step went
pub fn outcome_line(result: &Result<(), PlatformError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(e) => format!("FAIL: {}", e),
    }
}

/// Platform-agnostic network interface
pub trait NetworkPlatform: Send + Sync {
    /// Capture the current network configuration. Best effort; fields that
    /// cannot be detected stay empty.
    fn capture_snapshot(&self) -> NetworkSnapshot;

    /// Steps that restore networking to `snapshot`
    fn cleanup_steps(&self, snapshot: &NetworkSnapshot) -> Vec<CleanupStep>;
}

/// Placeholder for platforms without a cleanup implementation
pub struct UnsupportedNetwork;

impl NetworkPlatform for UnsupportedNetwork {
    fn capture_snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot::default()
    }

    fn cleanup_steps(&self, _snapshot: &NetworkSnapshot) -> Vec<CleanupStep> {
        vec![CleanupStep::new(
            "Restoring network",
            "(none)",
            || Err(PlatformError::UnsupportedPlatform),
        )]
    }
}

/// Get the network platform for the current OS
pub fn native_platform() -> Arc<dyn NetworkPlatform> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(mac::MacNetwork::new())
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxNetwork::new())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Arc::new(UnsupportedNetwork)
    }
}

/// Run a command, mapping a non-zero exit to an error carrying stderr
pub(crate) fn run_cmd(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    run_cmd_output(program, args).map(|_| ())
}

/// Run a command and return its trimmed stdout
pub(crate) fn run_cmd_output(program: &str, args: &[&str]) -> Result<String, PlatformError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| PlatformError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(PlatformError::CommandFailed { command, stderr });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Nameservers from resolv.conf content, skipping the systemd stub resolver
pub(crate) fn parse_resolv_conf(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("nameserver"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|server| *server != "127.0.0.53")
        .map(String::from)
        .collect()
}
