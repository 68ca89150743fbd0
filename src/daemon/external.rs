//! Detection of VPN processes this daemon did not start

use super::Daemon;
use crate::state::{ConnStatus, ExternalVpn};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// First argument that is neither a flag nor the binary itself
pub fn extract_host_from_args(args: &[&str], binary_name: &str) -> String {
    args.iter()
        .find(|arg| !arg.starts_with('-') && !is_binary(arg, binary_name))
        .map(|arg| arg.to_string())
        .unwrap_or_default()
}

fn is_binary(name: &str, binary_name: &str) -> bool {
    Path::new(name)
        .file_name()
        .is_some_and(|file| file.to_string_lossy() == binary_name)
}

/// Find a VPN process in `ps -o pid=,comm=,args=` output, skipping `exclude`
pub fn find_external(ps_output: &str, binary_name: &str, exclude: &[u32]) -> Option<ExternalVpn> {
    ps_output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let pid: u32 = fields.next()?.parse().ok()?;
        let comm = fields.next()?;
        if !comm.ends_with(binary_name) || exclude.contains(&pid) {
            return None;
        }
        let args: Vec<&str> = fields.collect();
        Some(ExternalVpn {
            pid,
            host: extract_host_from_args(&args, binary_name),
        })
    })
}

async fn list_processes() -> io::Result<String> {
    let output = tokio::process::Command::new("ps")
        .args(["-Ao", "pid=,comm=,args="])
        .output()
        .await?;
    if !output.status.success() {
        return Err(io::Error::other(format!("ps exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl Daemon {
    pub(super) async fn external_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        let mut ticker =
            tokio::time::interval(self.options.external_check().max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            self.check_external().await;
        }
    }

    async fn check_external(&self) {
        let status = self.state.read().await.status();
        if !matches!(status, ConnStatus::Disconnected | ConnStatus::External) {
            self.state.write().await.clear_external();
            return;
        }
        // Between reconnect attempts our own session is only paused
        if self.reconnect.lock().await.in_flight {
            return;
        }

        let own = self.vpn.lock().await.as_ref().map(|p| p.pid());
        let exclude: Vec<u32> = own.into_iter().chain([std::process::id()]).collect();

        let listing = match list_processes().await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("Process scan failed: {}", e);
                return;
            }
        };

        let found = find_external(&listing, &self.binary_name(), &exclude);
        let changed = {
            let mut state = self.state.write().await;
            match &found {
                Some(ext) => state.set_external(ext.pid, ext.host.clone()),
                None => state.clear_external(),
            }
        };

        if changed {
            match &found {
                Some(ext) => info!("External VPN detected (pid {}, host {})", ext.pid, ext.host),
                None => info!("External VPN gone"),
            }
            self.broadcast_state().await;
        }
    }
}
