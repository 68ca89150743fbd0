//! Connect and disconnect

use super::{try_claim, Daemon};
use crate::config::Connection;
use crate::ipc::protocol::{ErrorCode, Event};
use crate::state::ConnStatus;
use crate::vpn::process::{command_line, signal_pid};
use crate::vpn::terminate::Termination;
use crate::vpn::{build_args, terminate, SupervisorError, VpnProcess};
use nix::sys::signal::Signal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Daemon {
    pub(super) async fn handle_connect(self: &Arc<Self>, conn_id: String, password: Option<String>) {
        let accepted = self.state.write().await.begin_connect(&conn_id);
        let conn = match accepted {
            Ok(conn) => conn,
            Err(code) => {
                let message = match code {
                    ErrorCode::AlreadyConnected => "Already connected or connecting".to_string(),
                    _ => format!("Connection not found: {}", conn_id),
                };
                warn!("Rejected connect to {}: {}", conn_id, message);
                self.send(Event::error(code, message)).await;
                return;
            }
        };

        let password = password.filter(|p| !p.is_empty());
        {
            let mut rc = self.reconnect.lock().await;
            rc.cancel();
            rc.disconnect_requested = false;
            if conn.has_password
                && let Some(password) = &password
            {
                rc.cache_password(&conn.id, password);
            }
        }

        if let Err(e) = self.logs.lock().await.reset().await {
            warn!("Failed to reset session log: {}", e);
        }

        info!("Connecting to {} ({})", conn.name, conn.host);
        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = this.capture_network().await;
            this.state.write().await.set_network_snapshot(snapshot);
            this.launch(conn, password, false).await;
        });
    }

    /// Start the VPN for `conn` and adopt it as the session's process.
    /// During a reconnect a launch failure is reported but the reconnect loop
    /// owns the terminal `disconnected`.
    pub(super) async fn launch(
        self: &Arc<Self>,
        conn: Connection,
        password: Option<String>,
        reconnecting: bool,
    ) {
        let program = self.options.vpn_binary.clone();
        let args = build_args(&conn, password.is_some());
        self.add_log(format!("$ {}", command_line(&program, &args))).await;

        let spawned = VpnProcess::start(program.clone(), args).await;
        let (process, output) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.launch_failed(&conn.id, e, reconnecting).await;
                return;
            }
        };
        let pid = process.pid();

        let orphan = {
            let rc = self.reconnect.lock().await;
            let mut vpn = self.vpn.lock().await;
            let mut state = self.state.write().await;

            let wanted = !rc.disconnect_requested
                && !self.is_shutting_down()
                && vpn.is_none()
                && state.status().is_active()
                && state.active_conn_id() == Some(conn.id.as_str());
            if wanted {
                state.set_vpn_pid(pid);
                *vpn = Some(process);
                None
            } else {
                Some(process)
            }
        };

        if let Some(mut orphan) = orphan {
            info!("Session changed while {} was starting, stopping pid {}", program, pid);
            terminate(&mut orphan, self.options.term_grace()).await;
            return;
        }

        info!("Started {} (pid {})", program, pid);
        let this = self.clone();
        tokio::spawn(async move { this.stream_output(pid, output).await });

        if let Some(password) = password {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.options.password_delay()).await;
                let input = {
                    let vpn = this.vpn.lock().await;
                    vpn.as_ref().filter(|p| p.pid() == pid).map(VpnProcess::input)
                };
                if let Some(input) = input
                    && let Err(e) = input.send_line(password).await
                {
                    warn!("Failed to send password to VPN: {}", e);
                }
            });
        }
    }

    async fn launch_failed(&self, conn_id: &str, e: SupervisorError, reconnecting: bool) {
        error!("Failed to start VPN: {}", e);
        self.add_log(format!("Error: {}", e)).await;
        self.send(Event::error(e.code(), e.to_string())).await;

        let reset = {
            let mut state = self.state.write().await;
            if state.status().is_active() && state.active_conn_id() == Some(conn_id) {
                state.reset();
                true
            } else {
                false
            }
        };
        if reset && !reconnecting {
            self.send(Event::Disconnected).await;
        }
    }

    pub(super) async fn handle_disconnect(self: &Arc<Self>) {
        let interrupted_reconnect = self.cancel_reconnect().await;

        let status = self.state.read().await.status();
        match status {
            // Between attempts: nothing to kill, but the session still ends
            ConnStatus::Disconnected if interrupted_reconnect => {
                info!("Reconnect cancelled by disconnect");
                self.add_log("Reconnect cancelled").await;
                self.state.write().await.reset();
                self.send(Event::Disconnected).await;
            }
            ConnStatus::Disconnected => debug!("Disconnect while disconnected, ignoring"),
            ConnStatus::External => self.disconnect_external().await,
            _ => {
                if !try_claim(&self.disconnecting) {
                    debug!("Disconnect already in progress");
                    return;
                }
                let this = self.clone();
                tokio::spawn(async move {
                    this.disconnect_vpn(true).await;
                    this.disconnecting.store(false, Ordering::SeqCst);
                });
            }
        }
    }

    /// SIGTERM, grace period, SIGKILL; then reset the session
    pub(super) async fn disconnect_vpn(&self, run_cleanup: bool) {
        info!("Disconnecting");
        let process = self.vpn.lock().await.take();

        if let Some(mut process) = process {
            let pid = process.pid();
            self.add_log(format!("$ kill -TERM {}", pid)).await;

            let mut termination = Termination::new(&mut process);
            termination.send_term();
            if !termination.wait_exit(self.options.term_grace()).await {
                warn!("VPN pid {} ignored SIGTERM", pid);
                self.add_log(format!("$ kill -KILL {}", pid)).await;
                termination.kill().await;
            }
            info!("VPN process {} stopped", pid);
        }

        let (snapshot, auto_cleanup) = {
            let mut state = self.state.write().await;
            state.reset();
            (state.network_snapshot().cloned(), state.settings().auto_cleanup)
        };
        self.send(Event::Disconnected).await;

        if run_cleanup && auto_cleanup {
            match snapshot {
                Some(snapshot) => self.auto_cleanup(snapshot).await,
                None => debug!("No network snapshot, skipping cleanup"),
            }
        }
    }

    /// Stop a VPN this daemon did not start
    async fn disconnect_external(&self) {
        let external = self.state.write().await.take_external();
        let Some(external) = external else {
            return;
        };

        info!("Stopping external VPN (pid {}, host {})", external.pid, external.host);
        self.add_log(format!("$ kill -TERM {}", external.pid)).await;
        if let Err(e) = signal_pid(external.pid, Signal::SIGTERM) {
            warn!("Failed to signal external VPN {}: {}", external.pid, e);
        }
        self.send(Event::Disconnected).await;
    }
}
