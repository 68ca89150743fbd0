//! VPN output handling and exit detection

use super::Daemon;
use crate::ipc::protocol::{Event, ReconnectReason};
use crate::vpn::classifier::tunnel_device;
use crate::vpn::process::OutputReceiver;
use crate::vpn::{classify, terminate, LineEvent, LineSplitter};
use std::sync::Arc;
use tracing::{debug, info};

impl Daemon {
    /// Log and classify everything the VPN prints, then handle its exit once
    /// the pty closes
    pub(super) async fn stream_output(self: Arc<Self>, pid: u32, mut output: OutputReceiver) {
        let mut splitter = LineSplitter::new();

        while let Some(chunk) = output.recv().await {
            let split = splitter.push(&chunk);
            for line in split.lines {
                self.add_log(&line).await;
                self.apply_line(pid, &line).await;
            }
            if let Some(prompt) = split.prompt {
                self.add_log(&prompt).await;
                self.apply_line(pid, &prompt).await;
            }
        }

        if let Some(rest) = splitter.finish() {
            self.add_log(&rest).await;
        }

        self.handle_vpn_exit(pid).await;
    }

    async fn is_current_pid(&self, pid: u32) -> bool {
        self.vpn.lock().await.as_ref().is_some_and(|p| p.pid() == pid)
    }

    async fn apply_line(&self, pid: u32, line: &str) {
        // Output from a process we already let go of is only logged
        if !self.is_current_pid(pid).await {
            return;
        }

        if let Some(device) = tunnel_device(line) {
            let recorded = self.state.write().await.record_tunnel_device(&device);
            if recorded {
                info!("VPN tunnel device is {}", device);
            }
        }

        match classify(line) {
            LineEvent::Connected { ip, pid: vpn_pid } => {
                let connected = self.state.write().await.mark_connected(ip.as_deref(), vpn_pid);
                if let Some((ip, pid)) = connected {
                    self.reconnect.lock().await.attempt = 0;
                    info!("VPN connected (ip {}, pid {})", ip, pid);
                    self.send(Event::Connected { ip, pid }).await;
                }
            }
            LineEvent::Prompt { is_password } => {
                let prompting = self.state.write().await.enter_prompt();
                if prompting {
                    debug!("VPN prompt (password: {})", is_password);
                    self.send(Event::Prompt { is_password }).await;
                }
            }
            LineEvent::None => {}
        }
    }

    /// The pty for `pid` closed. Runs at most once per process: whoever takes
    /// the handle out of the slot owns the teardown.
    pub(super) async fn handle_vpn_exit(self: &Arc<Self>, pid: u32) {
        let process = {
            let mut vpn = self.vpn.lock().await;
            if vpn.as_ref().is_some_and(|p| p.pid() == pid) {
                vpn.take()
            } else {
                None
            }
        };
        let Some(mut process) = process else {
            debug!("Exit of VPN pid {} already handled", pid);
            return;
        };
        terminate(&mut process, self.options.term_grace()).await;
        drop(process);

        let (stopping, disconnect_requested, reconnecting) = {
            let rc = self.reconnect.lock().await;
            (rc.stopping_for_reconnect, rc.disconnect_requested, rc.in_flight)
        };
        if stopping {
            debug!("VPN pid {} stopped for reconnect", pid);
            return;
        }
        if disconnect_requested {
            debug!("VPN pid {} exited after disconnect request", pid);
            return;
        }

        let exit = self.state.write().await.take_exit();
        info!("VPN process {} exited (status was {:?})", pid, exit.status);

        if reconnecting {
            // The reconnect loop sees the state change and moves on
            return;
        }

        if exit.should_reconnect()
            && let Some(conn_id) = exit.conn_id
        {
            self.add_log("--- Connection lost, will reconnect ---").await;
            self.spawn_reconnect(conn_id, ReconnectReason::Exit);
            return;
        }

        self.send(Event::Disconnected).await;
    }
}
