//! macOS network snapshot and cleanup
//!
//! # Commands
//!
//! ```bash
//! # Snapshot
//! route -n get default
//! networksetup -listallhardwareports
//! networksetup -getdnsservers Wi-Fi
//!
//! # Cleanup
//! ifconfig utun3 down
//! route -n flush
//! networksetup -setdnsservers Wi-Fi 1.1.1.1 1.0.0.1
//! dscacheutil -flushcache && killall -HUP mDNSResponder
//! ```

use super::{
    parse_resolv_conf, run_cmd, run_cmd_output, CleanupStep, NetworkPlatform, NetworkSnapshot,
};
use std::time::Duration;
use tracing::debug;

pub struct MacNetwork;

impl MacNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkPlatform for MacNetwork {
    fn capture_snapshot(&self) -> NetworkSnapshot {
        let mut snap = NetworkSnapshot::default();

        match run_cmd_output("route", &["-n", "get", "default"]) {
            Ok(out) => {
                snap.default_interface = route_field(&out, "interface:").unwrap_or_default();
                snap.default_gateway = route_field(&out, "gateway:").unwrap_or_default();
            }
            Err(e) => debug!("Could not read default route: {}", e),
        }

        if !snap.default_interface.is_empty()
            && let Ok(out) = run_cmd_output("networksetup", &["-listallhardwareports"])
        {
            snap.wifi_service_name =
                hardware_port_for(&out, &snap.default_interface).unwrap_or_default();
        }

        let service = if snap.wifi_service_name.is_empty() {
            snap.default_interface.clone()
        } else {
            snap.wifi_service_name.clone()
        };
        snap.dns_servers = run_cmd_output("networksetup", &["-getdnsservers", &service])
            .ok()
            .map(|out| parse_dns_servers(&out))
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| {
                std::fs::read_to_string("/etc/resolv.conf")
                    .map(|c| parse_resolv_conf(&c))
                    .unwrap_or_default()
            });

        snap
    }

    fn cleanup_steps(&self, snap: &NetworkSnapshot) -> Vec<CleanupStep> {
        let tunnel = non_empty_or(&snap.tunnel_interface, "utun0");
        let net = non_empty_or(&snap.default_interface, "en0");
        let wifi = non_empty_or(&snap.wifi_service_name, "Wi-Fi");
        let dns = if snap.dns_servers.is_empty() {
            vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
        } else {
            snap.dns_servers.clone()
        };
        let joined = dns.join(" ");

        let mut steps = Vec::new();

        {
            let tunnel = tunnel.clone();
            steps.push(CleanupStep::new(
                format!("Killing tunnel interface ({})", tunnel),
                format!("ifconfig {} down", tunnel),
                move || run_cmd("ifconfig", &[&tunnel, "down"]),
            ));
        }

        steps.push(CleanupStep::new("Flushing routes", "route -n flush", || {
            run_cmd("route", &["-n", "flush"])
        }));

        {
            let net = net.clone();
            steps.push(CleanupStep::new(
                format!("Restarting network interface ({})", net),
                format!("ifconfig {0} down && ifconfig {0} up", net),
                move || {
                    let _ = run_cmd("ifconfig", &[&net, "down"]);
                    std::thread::sleep(Duration::from_millis(500));
                    run_cmd("ifconfig", &[&net, "up"])
                },
            ));
        }

        steps.push(CleanupStep::new(
            format!("Restoring DNS to {}", joined),
            format!("networksetup -setdnsservers {} {}", wifi, joined),
            move || {
                let mut args = vec!["-setdnsservers", wifi.as_str()];
                args.extend(dns.iter().map(String::as_str));
                run_cmd("networksetup", &args)
            },
        ));

        steps.push(CleanupStep::new(
            "Flushing DNS cache",
            "dscacheutil -flushcache && killall -HUP mDNSResponder",
            || {
                let _ = run_cmd("dscacheutil", &["-flushcache"]);
                run_cmd("killall", &["-HUP", "mDNSResponder"])
            },
        ));

        steps
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Value of a `key: value` line in `route -n get` output
fn route_field(output: &str, key: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(key))
        .map(|v| v.trim().to_string())
}

/// Hardware port name for a device in `networksetup -listallhardwareports`
fn hardware_port_for(output: &str, device: &str) -> Option<String> {
    let needle = format!("Device: {}", device);
    let lines: Vec<&str> = output.lines().collect();
    lines.iter().enumerate().skip(1).find_map(|(i, line)| {
        if line.trim() != needle {
            return None;
        }
        lines[i - 1]
            .trim()
            .strip_prefix("Hardware Port:")
            .map(|p| p.trim().to_string())
    })
}

fn parse_dns_servers(output: &str) -> Vec<String> {
    if output.contains("aren't any") {
        return Vec::new();
    }
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
