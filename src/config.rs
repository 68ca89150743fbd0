//! Configuration handling for lazyconnect
//!
//! Two separate concerns live here:
//!
//! - [`Config`]: the connection profiles and user settings. The client owns the
//!   JSON file (`config.json`); the daemon only ever sees a copy pushed over IPC
//!   with `config_update`.
//! - [`DaemonOptions`]: runtime tunables for the daemon itself, read from an
//!   optional `daemon.toml`. Every field has a default so the file can be
//!   absent or partial.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to parse daemon options: {0}")]
    OptionsError(#[from] toml::de::Error),
}

/// VPN protocol flavours understood by openconnect (`--protocol=`)
///
/// Names this crate does not know are passed through untouched so that a
/// newer openconnect can still be driven by an older daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Fortinet,
    Gp,
    /// openconnect's own default when no protocol is given
    #[default]
    Anyconnect,
    Nc,
    Pulse,
    F5,
    Array,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Fortinet => "fortinet",
            Protocol::Gp => "gp",
            Protocol::Anyconnect => "anyconnect",
            Protocol::Nc => "nc",
            Protocol::Pulse => "pulse",
            Protocol::F5 => "f5",
            Protocol::Array => "array",
            Protocol::Other(name) => name,
        }
    }
}

impl From<String> for Protocol {
    fn from(name: String) -> Self {
        match name.trim().to_lowercase().as_str() {
            "" | "anyconnect" => Protocol::Anyconnect,
            "fortinet" => Protocol::Fortinet,
            "gp" => Protocol::Gp,
            "nc" => Protocol::Nc,
            "pulse" => Protocol::Pulse,
            "f5" => Protocol::F5,
            "array" => Protocol::Array,
            _ => Protocol::Other(name.trim().to_string()),
        }
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> String {
        protocol.as_str().to_string()
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saved VPN connection profile
///
/// The password itself never lives here; `has_password` only records that the
/// client keeps one in its secret store and will pass it along on `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub has_password: bool,
    #[serde(default)]
    pub flags: String,
}

impl Connection {
    fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty() && !self.host.is_empty()
    }
}

/// User settings. Blank fields fall back to platform defaults via the
/// `*_or_default` accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub dns: String,
    pub reconnect: bool,
    pub auto_cleanup: bool,
    pub wifi_interface: String,
    pub net_interface: String,
    pub tunnel_interface: String,
    pub skip_version_update: String,
}

impl Settings {
    pub fn dns_or_default(&self) -> &str {
        if self.dns.is_empty() {
            "1.1.1.1 1.0.0.1"
        } else {
            &self.dns
        }
    }

    pub fn wifi_interface_or_default(&self) -> &str {
        if self.wifi_interface.is_empty() {
            "Wi-Fi"
        } else {
            &self.wifi_interface
        }
    }

    pub fn net_interface_or_default(&self) -> &str {
        if !self.net_interface.is_empty() {
            return &self.net_interface;
        }
        if cfg!(target_os = "macos") { "en0" } else { "eth0" }
    }

    pub fn tunnel_interface_or_default(&self) -> &str {
        if !self.tunnel_interface.is_empty() {
            return &self.tunnel_interface;
        }
        if cfg!(target_os = "macos") { "utun0" } else { "tun0" }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: Settings,
}

impl Config {
    /// Drop profiles that cannot be connected to (no id, name or host)
    pub fn retain_valid(&mut self) -> usize {
        let before = self.connections.len();
        self.connections.retain(Connection::is_valid);
        before - self.connections.len()
    }

    pub fn find(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Load the client config. A missing file yields an empty config and
    /// incomplete profiles (no id, name or host) are dropped.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let mut config: Config = serde_json::from_str(&content)?;
        config.retain_valid();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

/// Daemon runtime tunables (`daemon.toml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonOptions {
    /// VPN binary to launch; also the process name the external detector looks for
    pub vpn_binary: String,
    pub max_reconnect_attempts: u32,
    /// Backoff after each failed attempt; the last entry repeats
    pub reconnect_backoff_secs: Vec<u64>,
    pub connect_timeout_secs: u64,
    pub connect_poll_ms: u64,
    pub network_wait_initial_secs: u64,
    pub network_probe_max_secs: u64,
    pub network_probe_interval_ms: u64,
    pub network_probe_dial_timeout_secs: u64,
    /// SIGTERM to SIGKILL escalation
    pub term_grace_secs: u64,
    pub wake_tick_secs: u64,
    pub wake_threshold_secs: u64,
    pub wake_debounce_secs: u64,
    pub external_check_secs: u64,
    pub password_delay_ms: u64,
    pub version_mismatch_shutdown_ms: u64,
    /// Kill leftover VPN processes at daemon start
    pub kill_stale_processes: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            vpn_binary: "openconnect".to_string(),
            max_reconnect_attempts: 3,
            reconnect_backoff_secs: vec![2, 5, 10],
            connect_timeout_secs: 30,
            connect_poll_ms: 500,
            network_wait_initial_secs: 3,
            network_probe_max_secs: 30,
            network_probe_interval_ms: 1000,
            network_probe_dial_timeout_secs: 2,
            term_grace_secs: 8,
            wake_tick_secs: 5,
            wake_threshold_secs: 20,
            wake_debounce_secs: 10,
            external_check_secs: 5,
            password_delay_ms: 100,
            version_mismatch_shutdown_ms: 100,
            kill_stale_processes: true,
        }
    }
}

impl DaemonOptions {
    /// Load options from a TOML file, falling back to defaults if it is missing
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Backoff to sleep after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize)
            .min(self.reconnect_backoff_secs.len().saturating_sub(1));
        Duration::from_secs(self.reconnect_backoff_secs.get(idx).copied().unwrap_or(0))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn network_wait_initial(&self) -> Duration {
        Duration::from_secs(self.network_wait_initial_secs)
    }

    pub fn network_probe_max(&self) -> Duration {
        Duration::from_secs(self.network_probe_max_secs)
    }

    pub fn network_probe_interval(&self) -> Duration {
        Duration::from_millis(self.network_probe_interval_ms)
    }

    pub fn network_probe_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.network_probe_dial_timeout_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }

    pub fn wake_tick(&self) -> Duration {
        Duration::from_secs(self.wake_tick_secs)
    }

    pub fn wake_threshold(&self) -> Duration {
        Duration::from_secs(self.wake_threshold_secs)
    }

    pub fn wake_debounce(&self) -> Duration {
        Duration::from_secs(self.wake_debounce_secs)
    }

    pub fn external_check(&self) -> Duration {
        Duration::from_secs(self.external_check_secs)
    }

    pub fn password_delay(&self) -> Duration {
        Duration::from_millis(self.password_delay_ms)
    }

    pub fn version_mismatch_shutdown(&self) -> Duration {
        Duration::from_millis(self.version_mismatch_shutdown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_connection() -> Connection {
        Connection {
            id: "c1".to_string(),
            name: "Work".to_string(),
            protocol: Protocol::Anyconnect,
            host: "vpn.example.com".to_string(),
            username: "alice".to_string(),
            has_password: true,
            flags: "--no-dtls".to_string(),
        }
    }

    #[test]
    fn test_connection_json_uses_camel_case() {
        let json = serde_json::to_string(&sample_connection()).unwrap();
        assert!(json.contains("\"hasPassword\":true"));
        assert!(json.contains("\"protocol\":\"anyconnect\""));
    }

    #[test]
    fn test_settings_parse_from_client_json() {
        let json = r#"{"dns":"","reconnect":true,"autoCleanup":true,"netInterface":"wlan0"}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.reconnect);
        assert!(settings.auto_cleanup);
        assert_eq!(settings.net_interface_or_default(), "wlan0");
        assert_eq!(settings.dns_or_default(), "1.1.1.1 1.0.0.1");
        assert_eq!(settings.wifi_interface_or_default(), "Wi-Fi");
    }

    #[test]
    fn test_settings_platform_defaults() {
        let settings = Settings::default();
        #[cfg(target_os = "macos")]
        {
            assert_eq!(settings.net_interface_or_default(), "en0");
            assert_eq!(settings.tunnel_interface_or_default(), "utun0");
        }
        #[cfg(not(target_os = "macos"))]
        {
            assert_eq!(settings.net_interface_or_default(), "eth0");
            assert_eq!(settings.tunnel_interface_or_default(), "tun0");
        }
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let config = Config {
            connections: vec![sample_connection()],
            settings: Settings {
                reconnect: true,
                ..Default::default()
            },
        };
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.find("c1").is_some());
        assert!(loaded.find("c2").is_none());
    }

    #[test]
    fn test_load_missing_file_is_empty_config() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load(&temp_dir.path().join("nope.json")).unwrap();
        assert!(loaded.connections.is_empty());
    }

    #[test]
    fn test_load_drops_incomplete_connections() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"connections":[
                {"id":"a","name":"A","protocol":"gp","host":"a.example.com"},
                {"id":"","name":"B","protocol":"gp","host":"b.example.com"}
            ],"settings":{}}"#,
        )
        .unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.connections.len(), 1);
        assert_eq!(loaded.connections[0].id, "a");
    }

    #[test]
    fn test_unknown_protocol_passes_through() {
        let conn: Connection = serde_json::from_str(
            r#"{"id":"c1","name":"Lab","protocol":"ssl","host":"vpn.example.com"}"#,
        )
        .unwrap();
        assert_eq!(conn.protocol, Protocol::Other("ssl".to_string()));
        assert_eq!(conn.protocol.to_string(), "ssl");

        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains("\"protocol\":\"ssl\""));
    }

    #[test]
    fn test_missing_fields_decode_blank() {
        let conn: Connection =
            serde_json::from_str(r#"{"id":"c1","host":"vpn.example.com"}"#).unwrap();
        assert_eq!(conn.name, "");
        assert_eq!(conn.protocol, Protocol::Anyconnect);
        assert!(!conn.has_password);
    }

    #[test]
    fn test_retain_valid_drops_incomplete_profiles() {
        let mut config: Config = serde_json::from_str(
            r#"{"connections":[
                {"id":"c1","protocol":"gp","host":"vpn.example.com"},
                {"id":"c2","name":"Two","protocol":"GP","host":"two.example.com"},
                {"name":"Three","host":"three.example.com"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(config.retain_valid(), 2);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].id, "c2");
        assert_eq!(config.connections[0].protocol, Protocol::Gp);
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, "this is not json {{{{").unwrap();
        assert!(Config::load(&config_path).is_err());
    }

    #[test]
    fn test_daemon_options_partial_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");
        std::fs::write(&path, "max_reconnect_attempts = 5\nvpn_binary = \"/usr/sbin/openconnect\"\n")
            .unwrap();

        let opts = DaemonOptions::load_or_default(&path).unwrap();
        assert_eq!(opts.max_reconnect_attempts, 5);
        assert_eq!(opts.vpn_binary, "/usr/sbin/openconnect");
        assert_eq!(opts.connect_timeout_secs, 30);
    }

    #[test]
    fn test_daemon_options_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let opts = DaemonOptions::load_or_default(&temp_dir.path().join("daemon.toml")).unwrap();
        assert_eq!(opts, DaemonOptions::default());
    }

    #[test]
    fn test_backoff_schedule_repeats_last() {
        let opts = DaemonOptions::default();
        assert_eq!(opts.backoff(1), Duration::from_secs(2));
        assert_eq!(opts.backoff(2), Duration::from_secs(5));
        assert_eq!(opts.backoff(3), Duration::from_secs(10));
        assert_eq!(opts.backoff(7), Duration::from_secs(10));

        let empty = DaemonOptions {
            reconnect_backoff_secs: vec![],
            ..Default::default()
        };
        assert_eq!(empty.backoff(1), Duration::ZERO);
    }
}
