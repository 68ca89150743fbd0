//! The daemon: owner of the VPN session and dispatcher of client commands
//!
//! One [`Daemon`] value holds all shared state and is handed to every task
//! (accept loop, client read loop, pty output stream, monitors, reconnect
//! loop) behind an `Arc`.
//!
//! Lock order when more than one is held: `reconnect`, then `vpn`, then
//! `state`. The session log and the client slot are leaf locks: nothing else
//! is acquired while holding them, and the state lock is never held across a
//! client write.

mod cleanup;
mod external;
mod lifecycle;
mod output;
mod reconnect;
mod session;
mod wake;

pub use external::{extract_host_from_args, find_external};
pub use reconnect::extract_probe_addr;
pub use wake::{WakeCheck, WakeDetector};

use crate::config::{Config, ConfigError, DaemonOptions};
use crate::ipc::protocol::{Command, ErrorCode, Event, StateSnapshot};
use crate::ipc::server::{ClientSlot, CommandHandler};
use crate::logstore::{LogStore, LogStoreError};
use crate::paths::DaemonPaths;
use crate::platform::NetworkPlatform;
use crate::state::SessionState;
use crate::vpn::VpnProcess;
use reconnect::ReconnectControl;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Another daemon is already running on {0}")]
    AlreadyRunning(PathBuf),
    #[error("Failed to acquire daemon lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: nix::errno::Errno,
    },
    #[error("Failed to write PID file: {0}")]
    PidFile(std::io::Error),
    #[error("Failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to install signal handler: {0}")]
    Signal(std::io::Error),
    #[error("Session log error: {0}")]
    LogStore(#[from] LogStoreError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Daemon {
    version: String,
    options: DaemonOptions,
    paths: DaemonPaths,
    platform: Arc<dyn NetworkPlatform>,
    state: RwLock<SessionState>,
    vpn: Mutex<Option<VpnProcess>>,
    reconnect: Mutex<ReconnectControl>,
    logs: Mutex<LogStore>,
    clients: Arc<ClientSlot>,
    cleanup_running: AtomicBool,
    disconnecting: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    /// Set up a daemon that has not started serving yet. The session log is
    /// left alone until [`Daemon::run`] holds the singleton lock.
    pub fn new(
        version: impl Into<String>,
        options: DaemonOptions,
        paths: DaemonPaths,
        platform: Arc<dyn NetworkPlatform>,
    ) -> Result<Arc<Self>, DaemonError> {
        paths.ensure_dir()?;
        let logs = LogStore::new(&paths.vpn_log);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            version: version.into(),
            options,
            paths,
            platform,
            state: RwLock::new(SessionState::new()),
            vpn: Mutex::new(None),
            reconnect: Mutex::new(ReconnectControl::default()),
            logs: Mutex::new(logs),
            clients: Arc::new(ClientSlot::new()),
            cleanup_running: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            shutdown,
        }))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// What `get_state` reports
    pub async fn snapshot(&self) -> StateSnapshot {
        let total = self.logs.lock().await.total_lines();
        self.state.read().await.snapshot(total)
    }

    /// File name of the VPN binary, as it shows up in the process table
    fn binary_name(&self) -> String {
        Path::new(&self.options.vpn_binary)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.options.vpn_binary.clone())
    }

    async fn send(&self, event: Event) {
        self.clients.send(&event).await;
    }

    /// Append a line to the session log and forward it to the client
    async fn add_log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        let line_number = {
            let mut logs = self.logs.lock().await;
            match logs.append(line).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to append to session log: {}", e);
                    logs.total_lines()
                }
            }
        };
        self.send(Event::Log {
            line: line.to_string(),
            line_number,
        })
        .await;
    }

    /// Push the current state to the client unprompted
    async fn broadcast_state(&self) {
        let snapshot = self.snapshot().await;
        self.send(Event::State(snapshot)).await;
    }

    async fn handle_hello(self: &Arc<Self>, version: String) {
        let compatible = version == self.version;
        if compatible {
            info!("Client hello (version {})", version);
        } else {
            warn!(
                "Client version {} does not match daemon version {}, shutting down",
                version, self.version
            );
        }

        self.send(Event::HelloResponse {
            version: self.version.clone(),
            compatible,
        })
        .await;

        if !compatible {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.options.version_mismatch_shutdown()).await;
                this.request_shutdown();
            });
        }
    }

    async fn handle_get_logs(&self, from: u64, to: u64) {
        let (lines, total_lines) = {
            let logs = self.logs.lock().await;
            (logs.read_range(from, to).await, logs.total_lines())
        };
        let lines = lines.unwrap_or_else(|e| {
            warn!("Failed to read session log: {}", e);
            Vec::new()
        });
        self.send(Event::LogRange {
            from,
            lines,
            total_lines,
        })
        .await;
    }

    async fn handle_clear_logs(&self) {
        let result = self.logs.lock().await.reset().await;
        match result {
            Ok(()) => {
                debug!("Session log cleared");
                self.broadcast_state().await;
            }
            Err(e) => {
                warn!("Failed to clear session log: {}", e);
                self.send(Event::error(ErrorCode::ClearLogsFailed, e.to_string()))
                    .await;
            }
        }
    }

    async fn handle_input(&self, value: String) {
        let input = self.vpn.lock().await.as_ref().map(VpnProcess::input);
        let Some(input) = input else {
            debug!("Input with no VPN process running");
            self.send(Event::error(ErrorCode::NotRunning, "No VPN process running"))
                .await;
            return;
        };

        match input.send_line(value).await {
            Ok(()) => self.state.write().await.submit_input(),
            Err(e) => warn!("Failed to write input to VPN: {}", e),
        }
    }

    async fn handle_config_update(&self, mut config: Config) {
        let dropped = config.retain_valid();
        if dropped > 0 {
            warn!("Ignoring {} incomplete connection profiles", dropped);
        }
        debug!("Config updated ({} connections)", config.connections.len());
        self.state.write().await.set_config(config);
    }
}

impl CommandHandler for Daemon {
    async fn handle(self: Arc<Self>, cmd: Command) {
        match cmd {
            Command::Hello { version } => self.handle_hello(version).await,
            Command::GetState => self.broadcast_state().await,
            Command::GetLogs { from, to } => self.handle_get_logs(from, to).await,
            Command::ClearLogs => self.handle_clear_logs().await,
            Command::Connect { conn_id, password } => self.handle_connect(conn_id, password).await,
            Command::Disconnect => self.handle_disconnect().await,
            Command::Input { value } => self.handle_input(value).await,
            Command::ConfigUpdate { config } => self.handle_config_update(config).await,
            Command::Cleanup => self.handle_cleanup().await,
            Command::Shutdown => {
                info!("Shutdown requested by client");
                self.request_shutdown();
            }
            Command::Unknown => {}
        }
    }
}

/// Flip a single-flight flag. False if it was already set.
fn try_claim(flag: &AtomicBool) -> bool {
    !flag.swap(true, Ordering::SeqCst)
}
