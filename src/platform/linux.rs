//! Linux network snapshot and cleanup (`ip`, `resolvectl`, resolv.conf)

use super::{
    parse_resolv_conf, run_cmd, run_cmd_output, CleanupStep, NetworkPlatform, NetworkSnapshot,
    PlatformError,
};
use tracing::debug;

const RESOLV_CONF: &str = "/etc/resolv.conf";

pub struct LinuxNetwork {
    systemd_resolved: bool,
}

impl LinuxNetwork {
    pub fn new() -> Self {
        Self {
            systemd_resolved: has_resolvectl(),
        }
    }
}

impl Default for LinuxNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkPlatform for LinuxNetwork {
    fn capture_snapshot(&self) -> NetworkSnapshot {
        let mut snap = NetworkSnapshot::default();

        match run_cmd_output("ip", &["-o", "route", "show", "default"]) {
            Ok(out) => {
                snap.default_interface = field_after(&out, "dev").unwrap_or_default();
                snap.default_gateway = field_after(&out, "via").unwrap_or_default();
            }
            Err(e) => debug!("Could not read default route: {}", e),
        }
        // No separate wifi service concept on Linux
        snap.wifi_service_name = snap.default_interface.clone();

        snap.dns_servers = if self.systemd_resolved {
            match run_cmd_output("resolvectl", &["dns"]) {
                Ok(out) => parse_resolvectl_dns(&out),
                Err(_) => read_resolv_conf(),
            }
        } else {
            read_resolv_conf()
        };

        snap
    }

    fn cleanup_steps(&self, snap: &NetworkSnapshot) -> Vec<CleanupStep> {
        let tunnel = non_empty_or(&snap.tunnel_interface, "tun0");
        let net = non_empty_or(&snap.default_interface, "eth0");
        let gateway = snap.default_gateway.clone();
        let dns = snap.dns_servers.clone();

        let mut steps = Vec::new();

        {
            let tunnel = tunnel.clone();
            steps.push(CleanupStep::new(
                format!("Killing tunnel interface ({})", tunnel),
                format!("ip link set {} down", tunnel),
                move || run_cmd("ip", &["link", "set", &tunnel, "down"]),
            ));
        }

        {
            let tunnel = tunnel.clone();
            steps.push(CleanupStep::new(
                format!("Flushing VPN routes ({})", tunnel),
                format!("ip route flush dev {}", tunnel),
                move || run_cmd("ip", &["route", "flush", "dev", &tunnel]),
            ));
        }

        if !gateway.is_empty() {
            let net = net.clone();
            steps.push(CleanupStep::new(
                format!("Restoring default route via {}", gateway),
                format!("ip route add default via {} dev {}", gateway, net),
                move || {
                    // The old default may already be gone
                    let _ = run_cmd("ip", &["route", "del", "default"]);
                    run_cmd("ip", &["route", "add", "default", "via", &gateway, "dev", &net])
                },
            ));
        }

        if !dns.is_empty() {
            let joined = dns.join(" ");
            if self.systemd_resolved {
                let net = net.clone();
                steps.push(CleanupStep::new(
                    format!("Restoring DNS to {}", joined),
                    format!("resolvectl dns {} {}", net, joined),
                    move || {
                        let mut args = vec!["dns", net.as_str()];
                        args.extend(dns.iter().map(String::as_str));
                        run_cmd("resolvectl", &args)
                    },
                ));
                steps.push(CleanupStep::new(
                    "Flushing DNS cache",
                    "resolvectl flush-caches",
                    || run_cmd("resolvectl", &["flush-caches"]),
                ));
            } else {
                steps.push(CleanupStep::new(
                    format!("Restoring DNS to {}", joined),
                    format!("write {}", RESOLV_CONF),
                    move || write_resolv_conf(&dns),
                ));
            }
        }

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

fn has_resolvectl() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("resolvectl").is_file()))
        .unwrap_or(false)
}

fn read_resolv_conf() -> Vec<String> {
    std::fs::read_to_string(RESOLV_CONF)
        .map(|c| parse_resolv_conf(&c))
        .unwrap_or_default()
}

fn write_resolv_conf(servers: &[String]) -> Result<(), PlatformError> {
    let content: String = servers
        .iter()
        .map(|s| format!("nameserver {}\n", s))
        .collect();
    std::fs::write(RESOLV_CONF, content)?;
    Ok(())
}

/// Token following `key` in `ip -o route` output
fn field_after(output: &str, key: &str) -> Option<String> {
    let mut fields = output.split_whitespace();
    while let Some(f) = fields.next() {
        if f == key {
            return fields.next().map(String::from);
        }
    }
    None
}

/// Servers from `resolvectl dns` output (`Link 2 (eth0): 1.1.1.1 8.8.8.8`)
fn parse_resolvectl_dns(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Global:"))
        .filter_map(|line| line.split_once(':').map(|(_, servers)| servers))
        .flat_map(str::split_whitespace)
        .map(String::from)
        .collect()
}
