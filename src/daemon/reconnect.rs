//! Automatic reconnection
//!
//! One reconnect session at a time: wait for the network to settle, probe the
//! VPN server with a TCP dial, then retry the connection with backoff. An
//! explicit disconnect cancels the session at any wait point.

use super::Daemon;
use crate::ipc::protocol::{Event, ReconnectReason};
use crate::state::ConnStatus;
use crate::vpn::terminate::Termination;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Reconnect coordination, shared by the command handlers and the loop
#[derive(Debug, Default)]
pub(crate) struct ReconnectControl {
    pub in_flight: bool,
    pub disconnect_requested: bool,
    pub stopping_for_reconnect: bool,
    /// Attempt of the running session; zero once connected
    pub attempt: u32,
    cancel: Option<watch::Sender<bool>>,
    passwords: HashMap<String, String>,
}

impl ReconnectControl {
    /// Claim the single reconnect slot
    fn begin(&mut self) -> Option<watch::Receiver<bool>> {
        if self.in_flight {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        self.in_flight = true;
        self.attempt = 0;
        self.cancel = Some(tx);
        Some(rx)
    }

    fn finish(&mut self) {
        self.in_flight = false;
        self.cancel = None;
    }

    /// Signal the running session, if any, to stop
    pub fn cancel(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.send_replace(true);
        }
    }

    pub fn cache_password(&mut self, conn_id: &str, password: &str) {
        self.passwords.insert(conn_id.to_string(), password.to_string());
    }

    pub fn cached_password(&self, conn_id: &str) -> Option<String> {
        self.passwords.get(conn_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

/// Wait points of a reconnect session: cancellation or daemon shutdown
/// interrupts whatever is being awaited
pub(crate) struct Interrupt {
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl Interrupt {
    pub fn new(cancel: watch::Receiver<bool>, shutdown: watch::Receiver<bool>) -> Self {
        Self { cancel, shutdown }
    }

    pub fn fired(&self) -> bool {
        *self.cancel.borrow() || *self.shutdown.borrow()
    }

    pub async fn run<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupted> {
        if self.fired() {
            return Err(Interrupted);
        }
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancel.wait_for(|c| *c) => Err(Interrupted),
            _ = self.shutdown.wait_for(|s| *s) => Err(Interrupted),
        }
    }

    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Connected,
    NeedsInput,
    Cancelled,
    /// A user connect took the session over
    Superseded,
    ProfileMissing,
    NetworkUnavailable,
    Exhausted,
}

enum Attempt {
    Connected,
    Prompting,
    Failed,
    Interrupted,
}

/// `host:port` to dial when checking that the VPN server is reachable.
/// Accepts bare hosts, `host:port` and URLs; the port defaults to 443.
pub fn extract_probe_addr(host: &str) -> String {
    let mut rest = host.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    if let Some(end) = rest.find(['/', '?', '#']) {
        rest = &rest[..end];
    }
    if let Some((_, after)) = rest.rsplit_once('@') {
        rest = after;
    }

    let has_port = if rest.starts_with('[') {
        rest.contains("]:")
    } else {
        rest.contains(':')
    };
    if has_port {
        rest.to_string()
    } else {
        format!("{}:443", rest)
    }
}

impl Daemon {
    /// Explicit disconnect: stop any reconnect session and keep new ones
    /// from starting until the next user connect. True if this call is the
    /// one that interrupted a running session.
    pub(super) async fn cancel_reconnect(&self) -> bool {
        let mut rc = self.reconnect.lock().await;
        let interrupted = rc.in_flight && !rc.disconnect_requested;
        rc.disconnect_requested = true;
        rc.cancel();
        interrupted
    }

    /// Kill the current process without treating it as a lost connection
    pub(super) async fn stop_for_reconnect(&self) {
        self.reconnect.lock().await.stopping_for_reconnect = true;

        let process = self.vpn.lock().await.take();
        if let Some(mut process) = process {
            let pid = process.pid();
            info!("Stopping VPN pid {} for reconnect", pid);
            self.add_log(format!("$ kill -KILL {}", pid)).await;
            Termination::new(&mut process).kill().await;
        }

        self.state.write().await.suspend_for_reconnect();
        self.reconnect.lock().await.stopping_for_reconnect = false;
    }

    /// Run a reconnect session in the background. Boxed because the session
    /// launches a VPN whose exit handling can come back here.
    pub(super) fn spawn_reconnect(self: &Arc<Self>, conn_id: String, reason: ReconnectReason) {
        let this = self.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(async move { this.start_auto_reconnect(conn_id, reason).await });
        tokio::spawn(task);
    }

    async fn start_auto_reconnect(self: &Arc<Self>, conn_id: String, reason: ReconnectReason) {
        let cancel = {
            let mut rc = self.reconnect.lock().await;
            if rc.disconnect_requested {
                debug!("Disconnect requested, not reconnecting");
                return;
            }
            match rc.begin() {
                Some(cancel) => cancel,
                None => {
                    debug!("Reconnect already in progress, ignoring {:?} trigger", reason);
                    return;
                }
            }
        };

        let mut interrupt = Interrupt::new(cancel, self.shutdown_signal());
        let outcome = self.run_reconnect(&conn_id, reason, &mut interrupt).await;
        self.reconnect.lock().await.finish();
        debug!("Reconnect to {} ended: {:?}", conn_id, outcome);

        match outcome {
            // Whoever cancelled owns the terminal event
            Outcome::Connected | Outcome::NeedsInput | Outcome::Superseded | Outcome::Cancelled => {}
            Outcome::ProfileMissing => {
                warn!("Reconnect failed: connection {} not found", conn_id);
                self.add_log("Reconnect failed: connection not found").await;
                self.end_reconnect_session(&conn_id).await;
            }
            Outcome::NetworkUnavailable => {
                warn!("Reconnect failed: network not available");
                self.add_log("Reconnect failed: network not available").await;
                self.end_reconnect_session(&conn_id).await;
            }
            Outcome::Exhausted => {
                warn!("All reconnect attempts failed");
                self.add_log("All reconnect attempts failed").await;
                self.end_reconnect_session(&conn_id).await;
            }
        }
    }

    /// Terminal disconnect for a reconnect session, unless the user has
    /// started something else meanwhile
    async fn end_reconnect_session(&self, conn_id: &str) {
        let ended = {
            let mut state = self.state.write().await;
            let ours = state.active_conn_id().is_none_or(|id| id == conn_id);
            if state.status() == ConnStatus::Disconnected && ours {
                state.reset();
                true
            } else {
                false
            }
        };
        if ended {
            self.send(Event::Disconnected).await;
        }
    }

    async fn run_reconnect(
        self: &Arc<Self>,
        conn_id: &str,
        reason: ReconnectReason,
        interrupt: &mut Interrupt,
    ) -> Outcome {
        let max = self.options.max_reconnect_attempts;
        self.send(Event::Reconnecting {
            conn_id: conn_id.to_string(),
            reason,
            attempt: 0,
            max,
        })
        .await;

        let conn = self.state.read().await.find_connection(conn_id);
        let Some(conn) = conn else {
            return Outcome::ProfileMissing;
        };

        info!("Reconnecting to {} ({:?})", conn.name, reason);
        self.add_log("Waiting for network...").await;
        if interrupt.sleep(self.options.network_wait_initial()).await.is_err() {
            return Outcome::Cancelled;
        }
        match self.wait_for_network(&conn.host, interrupt).await {
            Ok(true) => {}
            Ok(false) => return Outcome::NetworkUnavailable,
            Err(Interrupted) => return Outcome::Cancelled,
        }
        self.add_log("Network available").await;

        let password = if conn.has_password {
            self.reconnect.lock().await.cached_password(conn_id)
        } else {
            None
        };

        for attempt in 1..=max {
            {
                let mut rc = self.reconnect.lock().await;
                if interrupt.fired() || rc.disconnect_requested {
                    return Outcome::Cancelled;
                }
                rc.attempt = attempt;
                if !self.state.write().await.begin_reconnect_attempt(conn_id) {
                    return Outcome::Superseded;
                }
            }

            info!("Reconnect attempt {}/{}", attempt, max);
            self.add_log(format!("Reconnecting... (attempt {}/{})", attempt, max))
                .await;
            self.send(Event::Reconnecting {
                conn_id: conn_id.to_string(),
                reason,
                attempt,
                max,
            })
            .await;

            self.launch(conn.clone(), password.clone(), true).await;

            match self.await_attempt(interrupt).await {
                Attempt::Connected => {
                    info!("Reconnected to {}", conn.name);
                    self.add_log("Reconnected successfully").await;
                    return Outcome::Connected;
                }
                Attempt::Prompting => return Outcome::NeedsInput,
                Attempt::Interrupted => return Outcome::Cancelled,
                Attempt::Failed => {}
            }

            if attempt < max {
                let backoff = self.options.backoff(attempt);
                self.add_log(format!("Retrying in {}s...", backoff.as_secs()))
                    .await;
                if interrupt.sleep(backoff).await.is_err() {
                    return Outcome::Cancelled;
                }
            }
        }

        Outcome::Exhausted
    }

    /// Dial the VPN server until it answers or the probe window closes
    async fn wait_for_network(&self, host: &str, interrupt: &mut Interrupt) -> Result<bool, Interrupted> {
        let addr = extract_probe_addr(host);
        let deadline = Instant::now() + self.options.network_probe_max();

        loop {
            let dial = timeout(
                self.options.network_probe_dial_timeout(),
                TcpStream::connect(addr.clone()),
            );
            match interrupt.run(dial).await? {
                Ok(Ok(_)) => {
                    debug!("Network probe to {} succeeded", addr);
                    return Ok(true);
                }
                Ok(Err(e)) => debug!("Network probe to {} failed: {}", addr, e),
                Err(_) => debug!("Network probe to {} timed out", addr),
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }
            interrupt.sleep(self.options.network_probe_interval()).await?;
        }
    }

    /// Poll the session until the attempt settles or times out
    async fn await_attempt(&self, interrupt: &mut Interrupt) -> Attempt {
        let deadline = Instant::now() + self.options.connect_timeout();

        loop {
            if interrupt.sleep(self.options.connect_poll()).await.is_err() {
                return Attempt::Interrupted;
            }
            let status = self.state.read().await.status();
            match status {
                ConnStatus::Connected => return Attempt::Connected,
                ConnStatus::Prompting => return Attempt::Prompting,
                ConnStatus::Disconnected => return Attempt::Failed,
                _ => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        warn!("Reconnect attempt timed out");
        self.stop_for_reconnect().await;
        Attempt::Failed
    }
}
