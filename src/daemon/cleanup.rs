//! Network snapshot capture and cleanup runs

use super::{try_claim, Daemon};
use crate::config::Settings;
use crate::ipc::protocol::{ErrorCode, Event};
use crate::platform::{outcome_line, NetworkSnapshot, PlatformError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Settings the user filled in win over what was detected; whatever is
/// still blank afterwards gets the platform default
pub(crate) fn apply_overrides(snapshot: &mut NetworkSnapshot, settings: &Settings) {
    if !settings.net_interface.is_empty() {
        snapshot.default_interface = settings.net_interface.clone();
    }
    if !settings.wifi_interface.is_empty() {
        snapshot.wifi_service_name = settings.wifi_interface.clone();
    }
    if !settings.dns.trim().is_empty() {
        snapshot.dns_servers = settings.dns.split_whitespace().map(String::from).collect();
    }
    if !settings.tunnel_interface.is_empty() {
        snapshot.tunnel_interface = settings.tunnel_interface.clone();
    }

    if snapshot.default_interface.is_empty() {
        snapshot.default_interface = settings.net_interface_or_default().to_string();
    }
    if snapshot.wifi_service_name.is_empty() {
        snapshot.wifi_service_name = settings.wifi_interface_or_default().to_string();
    }
    if snapshot.dns_servers.is_empty() {
        snapshot.dns_servers = settings
            .dns_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();
    }
    if snapshot.tunnel_interface.is_empty() {
        snapshot.tunnel_interface = settings.tunnel_interface_or_default().to_string();
    }
}

impl Daemon {
    /// Capture the pre-VPN network, with settings overrides applied
    pub(super) async fn capture_network(&self) -> NetworkSnapshot {
        let platform = self.platform.clone();
        let mut snapshot = match tokio::task::spawn_blocking(move || platform.capture_snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Network snapshot failed: {}", e);
                NetworkSnapshot::default()
            }
        };
        let settings = self.state.read().await.settings().clone();
        apply_overrides(&mut snapshot, &settings);
        snapshot
    }

    pub(super) async fn handle_cleanup(self: &Arc<Self>) {
        if !try_claim(&self.cleanup_running) {
            self.send(Event::error(ErrorCode::CleanupRunning, "Cleanup already running"))
                .await;
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let stored = this.state.read().await.network_snapshot().cloned();
            let snapshot = match stored {
                Some(snapshot) => snapshot,
                None => this.capture_network().await,
            };
            this.run_cleanup(snapshot).await;
            this.cleanup_running.store(false, Ordering::SeqCst);
        });
    }

    /// Cleanup after a user disconnect
    pub(super) async fn auto_cleanup(&self, snapshot: NetworkSnapshot) {
        if !try_claim(&self.cleanup_running) {
            warn!("Cleanup already running, skipping auto-cleanup");
            return;
        }
        self.run_cleanup(snapshot).await;
        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    async fn run_cleanup(&self, snapshot: NetworkSnapshot) {
        info!("Running network cleanup");
        let steps = self.platform.cleanup_steps(&snapshot);

        for step in steps {
            for line in step.intro_lines() {
                self.send(Event::CleanupStep { line }).await;
            }

            let name = step.name.clone();
            let result = match tokio::task::spawn_blocking(move || step.run()).await {
                Ok(result) => result,
                Err(e) => Err(PlatformError::Io(std::io::Error::other(e.to_string()))),
            };
            if let Err(e) = &result {
                warn!("Cleanup step '{}' failed: {}", name, e);
            }
            self.send(Event::CleanupStep {
                line: outcome_line(&result),
            })
            .await;
        }

        self.send(Event::CleanupDone).await;
        info!("Network cleanup finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_settings_keep_detected_values() {
        let mut snapshot = NetworkSnapshot {
            default_interface: "wlan0".to_string(),
            dns_servers: vec!["192.168.1.1".to_string()],
            ..Default::default()
        };
        apply_overrides(&mut snapshot, &Settings::default());
        assert_eq!(snapshot.default_interface, "wlan0");
        assert_eq!(snapshot.dns_servers, vec!["192.168.1.1"]);
    }

    #[test]
    fn test_blank_snapshot_gets_defaults() {
        let mut snapshot = NetworkSnapshot::default();
        apply_overrides(&mut snapshot, &Settings::default());
        assert_eq!(snapshot.dns_servers, vec!["1.1.1.1", "1.0.0.1"]);
        assert_eq!(snapshot.wifi_service_name, "Wi-Fi");
        assert!(!snapshot.default_interface.is_empty());
        assert!(!snapshot.tunnel_interface.is_empty());
    }

    #[test]
    fn test_settings_override_snapshot() {
        let mut snapshot = NetworkSnapshot {
            default_interface: "wlan0".to_string(),
            dns_servers: vec!["192.168.1.1".to_string()],
            ..Default::default()
        };
        let settings = Settings {
            dns: " 9.9.9.9   149.112.112.112 ".to_string(),
            net_interface: "en1".to_string(),
            wifi_interface: "AirPort".to_string(),
            tunnel_interface: "utun7".to_string(),
            ..Default::default()
        };
        apply_overrides(&mut snapshot, &settings);

        assert_eq!(snapshot.default_interface, "en1");
        assert_eq!(snapshot.wifi_service_name, "AirPort");
        assert_eq!(snapshot.dns_servers, vec!["9.9.9.9", "149.112.112.112"]);
        assert_eq!(snapshot.tunnel_interface, "utun7");
    }
}
