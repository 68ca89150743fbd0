//! Daemon startup and shutdown
//!
//! Startup order:
//! 1. refuse to start if the PID file is locked and the socket is present;
//!    the socket is never connected to, since that would evict the live
//!    daemon's client
//! 2. stop a stale daemon still holding the PID file lock without a socket
//! 3. optionally kill leftover VPN processes
//! 4. take the singleton lock on the PID file and write our PID
//! 5. bind the socket and serve until shutdown
//!
//! Only 4 and 5 are fatal; the rest is best effort.

use super::{Daemon, DaemonError};
use crate::ipc::server::{self, cleanup_ipc, IpcServer};
use crate::paths::DaemonPaths;
use crate::vpn::process::{pid_alive, signal_pid};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::Signal;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a stale daemon gets to release its socket after SIGTERM
const STALE_DAEMON_POLLS: u32 = 20;
const STALE_DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Daemon {
    /// Serve until shutdown is requested (client `shutdown`, version
    /// mismatch, SIGTERM or SIGINT)
    pub async fn run(self: Arc<Self>) -> Result<(), DaemonError> {
        self.paths.ensure_dir()?;

        if pid_file_locked(&self.paths.pid_file) {
            if self.paths.socket.exists() {
                return Err(DaemonError::AlreadyRunning(self.paths.socket.clone()));
            }
            stop_stale_daemon(&self.paths).await;
        }
        if self.options.kill_stale_processes {
            kill_stale_vpn(&self.binary_name()).await;
        }

        let lock = acquire_pid_lock(&self.paths.pid_file)?;
        if let Err(e) = self.logs.lock().await.reset().await {
            remove_pid_file(&self.paths.pid_file);
            return Err(e.into());
        }

        let listener = match server::bind(&self.paths.socket) {
            Ok(listener) => listener,
            Err(source) => {
                remove_pid_file(&self.paths.pid_file);
                return Err(DaemonError::Bind {
                    path: self.paths.socket.clone(),
                    source,
                });
            }
        };

        info!(
            "Daemon {} started (pid {}), listening on {:?}",
            self.version,
            std::process::id(),
            self.paths.socket
        );

        let signals = match spawn_signal_handler(self.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_ipc(&self.paths.socket);
                remove_pid_file(&self.paths.pid_file);
                return Err(e);
            }
        };
        tokio::spawn(self.clone().wake_monitor());
        tokio::spawn(self.clone().external_monitor());

        let ipc = IpcServer::new(
            self.paths.socket.clone(),
            self.clone(),
            self.clients.clone(),
            self.shutdown_signal(),
        );
        ipc.run(listener).await;

        signals.abort();
        self.teardown().await;
        drop(lock);

        info!("Daemon shutdown complete");
        Ok(())
    }

    async fn teardown(&self) {
        info!("Daemon shutting down");
        // Monitors and the reconnect loop watch the same signal
        self.request_shutdown();
        self.cancel_reconnect().await;

        let has_process = self.vpn.lock().await.is_some();
        let active = self.state.read().await.status().is_active();
        if has_process || active {
            self.disconnect_vpn(false).await;
        }

        self.clients.close().await;
        cleanup_ipc(&self.paths.socket);
        remove_pid_file(&self.paths.pid_file);
    }
}

/// Exclusive, non-blocking lock on the PID file, then write our PID into it
fn acquire_pid_lock(path: &Path) -> Result<Flock<File>, DaemonError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(DaemonError::PidFile)?;

    let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, source)| {
        DaemonError::Lock {
            path: path.to_path_buf(),
            source,
        }
    })?;

    // Truncate now that we hold the lock
    lock.set_len(0).map_err(DaemonError::PidFile)?;
    writeln!(lock, "{}", std::process::id()).map_err(DaemonError::PidFile)?;
    lock.sync_all().map_err(DaemonError::PidFile)?;
    Ok(lock)
}

/// Is another process holding the PID file lock?
fn pid_file_locked(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(_released_on_drop) => false,
        Err((_, Errno::EWOULDBLOCK)) => true,
        Err((_, e)) => {
            debug!("Could not probe PID file lock: {}", e);
            false
        }
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove PID file: {}", e);
    }
}

/// A previous daemon that still holds the lock but has lost its socket:
/// SIGTERM, wait for its socket to go away, then SIGKILL
async fn stop_stale_daemon(paths: &DaemonPaths) {
    let Ok(contents) = tokio::fs::read_to_string(&paths.pid_file).await else {
        return;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        debug!("Ignoring malformed PID file");
        return;
    };
    if pid == std::process::id() || !pid_alive(pid) || !pid_file_locked(&paths.pid_file) {
        return;
    }

    info!("Stopping stale daemon (pid {})", pid);
    if let Err(e) = signal_pid(pid, Signal::SIGTERM) {
        warn!("Failed to signal stale daemon {}: {}", pid, e);
        return;
    }

    for _ in 0..STALE_DAEMON_POLLS {
        if !paths.socket.exists() && !pid_file_locked(&paths.pid_file) {
            return;
        }
        tokio::time::sleep(STALE_DAEMON_POLL_INTERVAL).await;
    }

    warn!("Stale daemon {} did not exit, sending SIGKILL", pid);
    if let Err(e) = signal_pid(pid, Signal::SIGKILL) {
        error!("Failed to kill stale daemon {}: {}", pid, e);
    }
}

/// VPN processes left behind by a crashed daemon
async fn kill_stale_vpn(binary_name: &str) {
    let status = tokio::process::Command::new("pkill")
        .args(["-9", "-x", binary_name])
        .status()
        .await;
    match status {
        // pkill exits 1 when nothing matched
        Ok(status) if status.success() => info!("Killed leftover {} processes", binary_name),
        Ok(_) => debug!("No leftover {} processes", binary_name),
        Err(e) => debug!("pkill unavailable: {}", e),
    }
}

fn spawn_signal_handler(daemon: Arc<Daemon>) -> Result<JoinHandle<()>, DaemonError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        daemon.request_shutdown();
    }))
}
