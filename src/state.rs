//! Session state machine
//!
//! The single authoritative record of what the daemon is doing: connection
//! status, which profile is active, what the VPN reported (IP, PID), any
//! externally-launched VPN we noticed, plus the config snapshot and the
//! network snapshot captured for cleanup. Lives behind one `RwLock` in the
//! daemon and is only ever mutated through the transition methods below,
//! each of which refuses to apply from a status where it makes no sense.
//!
//! ```text
//! Disconnected -> Connecting <-> Prompting -> Connected -> Disconnected
//!      ^ |
//!      | v
//!    External
//! ```
//!
//! Nothing here is persisted; a restarted daemon starts `Disconnected`.

use crate::config::{Config, Connection, Settings};
use crate::ipc::protocol::{ErrorCode, StateSnapshot};
use crate::platform::NetworkSnapshot;
use serde::{Deserialize, Serialize};

/// Connection status, sent over the wire as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConnStatus {
    #[default]
    Disconnected,
    Connecting,
    Prompting,
    Connected,
    External,
}

impl ConnStatus {
    /// A session we launched is in progress
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnStatus::Connecting | ConnStatus::Prompting | ConnStatus::Connected
        )
    }
}

impl From<ConnStatus> for u8 {
    fn from(status: ConnStatus) -> u8 {
        match status {
            ConnStatus::Disconnected => 0,
            ConnStatus::Connecting => 1,
            ConnStatus::Prompting => 2,
            ConnStatus::Connected => 3,
            ConnStatus::External => 4,
        }
    }
}

impl TryFrom<u8> for ConnStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnStatus::Disconnected),
            1 => Ok(ConnStatus::Connecting),
            2 => Ok(ConnStatus::Prompting),
            3 => Ok(ConnStatus::Connected),
            4 => Ok(ConnStatus::External),
            other => Err(format!("unknown connection status {}", other)),
        }
    }
}

/// A VPN process running on the host that this daemon did not launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalVpn {
    pub pid: u32,
    pub host: String,
}

/// What the session looked like when its process went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSnapshot {
    pub status: ConnStatus,
    pub conn_id: Option<String>,
    pub reconnect_enabled: bool,
}

impl ExitSnapshot {
    pub fn should_reconnect(&self) -> bool {
        self.reconnect_enabled && self.conn_id.is_some() && self.status.is_active()
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    status: ConnStatus,
    active_conn_id: Option<String>,
    ip: Option<String>,
    pid: Option<u32>,
    external: Option<ExternalVpn>,
    config: Config,
    network_snapshot: Option<NetworkSnapshot>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn active_conn_id(&self) -> Option<&str> {
        self.active_conn_id.as_deref()
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn external(&self) -> Option<&ExternalVpn> {
        self.external.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn network_snapshot(&self) -> Option<&NetworkSnapshot> {
        self.network_snapshot.as_ref()
    }

    /// Replace the config snapshot wholesale
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    pub fn find_connection(&self, conn_id: &str) -> Option<Connection> {
        self.config.find(conn_id).cloned()
    }

    /// Accept a user `connect`. Leaves the state untouched on rejection.
    pub fn begin_connect(&mut self, conn_id: &str) -> Result<Connection, ErrorCode> {
        if self.status != ConnStatus::Disconnected {
            return Err(ErrorCode::AlreadyConnected);
        }
        let conn = self.find_connection(conn_id).ok_or(ErrorCode::InvalidConn)?;

        self.status = ConnStatus::Connecting;
        self.active_conn_id = Some(conn.id.clone());
        self.ip = None;
        self.pid = None;
        Ok(conn)
    }

    /// Start one reconnect attempt for `conn_id`. Refused (false) if
    /// something else took over the session in the meantime.
    pub fn begin_reconnect_attempt(&mut self, conn_id: &str) -> bool {
        if self.status != ConnStatus::Disconnected {
            return false;
        }
        self.status = ConnStatus::Connecting;
        self.active_conn_id = Some(conn_id.to_string());
        self.ip = None;
        self.pid = None;
        self.external = None;
        true
    }

    pub fn set_network_snapshot(&mut self, snapshot: NetworkSnapshot) {
        self.network_snapshot = Some(snapshot);
    }

    /// Record the tunnel device the VPN reported, if a snapshot exists
    pub fn record_tunnel_device(&mut self, device: &str) -> bool {
        match self.network_snapshot.as_mut() {
            Some(snap) => {
                snap.tunnel_interface = device.to_string();
                true
            }
            None => false,
        }
    }

    /// PID of the process we just spawned
    pub fn set_vpn_pid(&mut self, pid: u32) {
        if self.status.is_active() {
            self.pid = Some(pid);
        }
    }

    /// The VPN asked for input. Ignored once the session is gone.
    pub fn enter_prompt(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.status = ConnStatus::Prompting;
        true
    }

    /// The user answered a prompt; optimistic until the VPN says otherwise
    pub fn submit_input(&mut self) {
        if matches!(self.status, ConnStatus::Prompting | ConnStatus::Connecting) {
            self.status = ConnStatus::Connecting;
        }
    }

    /// Apply a connected line. Fields absent from the line keep their
    /// previous value. Returns the resulting (ip, pid).
    pub fn mark_connected(&mut self, ip: Option<&str>, pid: Option<u32>) -> Option<(String, u32)> {
        if !self.status.is_active() {
            return None;
        }
        self.status = ConnStatus::Connected;
        if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
            self.ip = Some(ip.to_string());
        }
        if let Some(pid) = pid.filter(|pid| *pid != 0) {
            self.pid = Some(pid);
        }
        Some((self.ip.clone().unwrap_or_default(), self.pid.unwrap_or(0)))
    }

    /// The supervised process exited. Captures what the session looked like
    /// and resets to `Disconnected`.
    pub fn take_exit(&mut self) -> ExitSnapshot {
        let snapshot = ExitSnapshot {
            status: self.status,
            conn_id: self.active_conn_id.clone(),
            reconnect_enabled: self.config.settings.reconnect,
        };
        self.reset();
        snapshot
    }

    /// The process was torn down on purpose to make room for a reconnect.
    /// Keeps the active connection id.
    pub fn suspend_for_reconnect(&mut self) {
        if self.status.is_active() {
            self.status = ConnStatus::Disconnected;
        }
        self.ip = None;
        self.pid = None;
    }

    /// Terminal disconnect
    pub fn reset(&mut self) {
        if self.status != ConnStatus::External {
            self.status = ConnStatus::Disconnected;
        }
        self.active_conn_id = None;
        self.ip = None;
        self.pid = None;
    }

    /// Reflect an external VPN. Only engages from `Disconnected`/`External`.
    /// Returns true when the detected process changed.
    pub fn set_external(&mut self, pid: u32, host: String) -> bool {
        if !matches!(self.status, ConnStatus::Disconnected | ConnStatus::External) {
            return false;
        }
        let changed = self.status != ConnStatus::External
            || self.external.as_ref().map(|e| e.pid) != Some(pid);
        self.status = ConnStatus::External;
        self.external = Some(ExternalVpn { pid, host });
        changed
    }

    /// The external VPN went away. Returns true if the status changed.
    pub fn clear_external(&mut self) -> bool {
        if self.status != ConnStatus::External {
            self.external = None;
            return false;
        }
        self.status = ConnStatus::Disconnected;
        self.external = None;
        true
    }

    /// Detach from an external VPN the user asked us to stop
    pub fn take_external(&mut self) -> Option<ExternalVpn> {
        if self.status != ConnStatus::External {
            return None;
        }
        self.status = ConnStatus::Disconnected;
        self.external.take()
    }

    /// Wire snapshot. IP and PID are only reported while they mean something.
    pub fn snapshot(&self, total_log_lines: u64) -> StateSnapshot {
        let (ip, pid) = match self.status {
            ConnStatus::Connected => (
                self.ip.clone().unwrap_or_default(),
                self.pid.unwrap_or(0),
            ),
            ConnStatus::External => (
                String::new(),
                self.external.as_ref().map(|e| e.pid).unwrap_or(0),
            ),
            _ => (String::new(), 0),
        };

        StateSnapshot {
            status: self.status,
            active_conn_id: self.active_conn_id.clone().unwrap_or_default(),
            ip,
            pid,
            total_log_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn state_with_connection(reconnect: bool) -> SessionState {
        let mut state = SessionState::new();
        state.set_config(Config {
            connections: vec![Connection {
                id: "c1".to_string(),
                name: "Work".to_string(),
                protocol: Protocol::Anyconnect,
                host: "vpn.example.com".to_string(),
                username: String::new(),
                has_password: false,
                flags: String::new(),
            }],
            settings: Settings {
                reconnect,
                ..Default::default()
            },
        });
        state
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(serde_json::to_string(&ConnStatus::Disconnected).unwrap(), "0");
        assert_eq!(serde_json::to_string(&ConnStatus::External).unwrap(), "4");
        let status: ConnStatus = serde_json::from_str("2").unwrap();
        assert_eq!(status, ConnStatus::Prompting);
        assert!(serde_json::from_str::<ConnStatus>("9").is_err());
    }

    #[test]
    fn test_connect_from_disconnected() {
        let mut state = state_with_connection(false);
        let conn = state.begin_connect("c1").unwrap();
        assert_eq!(conn.host, "vpn.example.com");
        assert_eq!(state.status(), ConnStatus::Connecting);
        assert_eq!(state.active_conn_id(), Some("c1"));
    }

    #[test]
    fn test_connect_rejected_when_not_disconnected() {
        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();

        for status in [ConnStatus::Connecting, ConnStatus::Prompting, ConnStatus::Connected] {
            state.status = status;
            assert_eq!(state.begin_connect("c1"), Err(ErrorCode::AlreadyConnected));
            assert_eq!(state.status(), status);
            assert_eq!(state.active_conn_id(), Some("c1"));
        }
    }

    #[test]
    fn test_connect_unknown_id() {
        let mut state = state_with_connection(false);
        assert_eq!(state.begin_connect("nope"), Err(ErrorCode::InvalidConn));
        assert_eq!(state.status(), ConnStatus::Disconnected);
        assert_eq!(state.active_conn_id(), None);
    }

    #[test]
    fn test_connect_rejected_while_external() {
        let mut state = state_with_connection(false);
        assert!(state.set_external(77, "vpn.example.com".to_string()));
        assert_eq!(state.begin_connect("c1"), Err(ErrorCode::AlreadyConnected));
    }

    #[test]
    fn test_prompt_and_input() {
        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();

        assert!(state.enter_prompt());
        assert_eq!(state.status(), ConnStatus::Prompting);
        state.submit_input();
        assert_eq!(state.status(), ConnStatus::Connecting);
    }

    #[test]
    fn test_prompt_ignored_after_disconnect() {
        let mut state = state_with_connection(false);
        assert!(!state.enter_prompt());
        assert_eq!(state.status(), ConnStatus::Disconnected);
    }

    #[test]
    fn test_connected_partial_updates_preserve_fields() {
        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();

        assert_eq!(
            state.mark_connected(Some("10.1.2.3"), None),
            Some(("10.1.2.3".to_string(), 0))
        );
        assert_eq!(
            state.mark_connected(None, Some(4242)),
            Some(("10.1.2.3".to_string(), 4242))
        );
        // An empty match must not erase what we already learned
        assert_eq!(
            state.mark_connected(Some(""), Some(0)),
            Some(("10.1.2.3".to_string(), 4242))
        );
        assert_eq!(state.status(), ConnStatus::Connected);
    }

    #[test]
    fn test_connected_ignored_when_disconnected() {
        let mut state = state_with_connection(false);
        assert_eq!(state.mark_connected(Some("10.0.0.1"), Some(1)), None);
        assert_eq!(state.status(), ConnStatus::Disconnected);
    }

    #[test]
    fn test_snapshot_hides_ip_until_connected() {
        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();
        state.set_vpn_pid(100);

        let snap = state.snapshot(3);
        assert_eq!(snap.status, ConnStatus::Connecting);
        assert_eq!(snap.pid, 0);
        assert_eq!(snap.active_conn_id, "c1");
        assert_eq!(snap.total_log_lines, 3);

        state.mark_connected(Some("10.0.0.9"), None);
        let snap = state.snapshot(3);
        assert_eq!(snap.ip, "10.0.0.9");
        assert_eq!(snap.pid, 100);
    }

    #[test]
    fn test_exit_snapshot_decides_reconnect() {
        let mut state = state_with_connection(true);
        state.begin_connect("c1").unwrap();
        state.mark_connected(None, None);

        let exit = state.take_exit();
        assert!(exit.should_reconnect());
        assert_eq!(exit.conn_id.as_deref(), Some("c1"));
        assert_eq!(state.status(), ConnStatus::Disconnected);
        assert_eq!(state.active_conn_id(), None);

        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();
        assert!(!state.take_exit().should_reconnect());
    }

    #[test]
    fn test_suspend_keeps_connection_id() {
        let mut state = state_with_connection(true);
        state.begin_connect("c1").unwrap();
        state.mark_connected(Some("10.0.0.2"), Some(5));

        state.suspend_for_reconnect();
        assert_eq!(state.status(), ConnStatus::Disconnected);
        assert_eq!(state.active_conn_id(), Some("c1"));
        assert_eq!(state.ip(), None);

        assert!(state.begin_reconnect_attempt("c1"));
        assert_eq!(state.status(), ConnStatus::Connecting);
    }

    #[test]
    fn test_reconnect_attempt_yields_to_user_connect() {
        let mut state = state_with_connection(true);
        state.begin_connect("c1").unwrap();
        assert!(!state.begin_reconnect_attempt("c1"));
        assert_eq!(state.status(), ConnStatus::Connecting);
    }

    #[test]
    fn test_external_only_from_disconnected() {
        let mut state = state_with_connection(false);
        state.begin_connect("c1").unwrap();
        assert!(!state.set_external(9, "h".to_string()));
        assert_eq!(state.status(), ConnStatus::Connecting);
    }

    #[test]
    fn test_external_change_detection() {
        let mut state = state_with_connection(false);
        assert!(state.set_external(9, "h".to_string()));
        assert!(!state.set_external(9, "h".to_string()));
        assert!(state.set_external(10, "h".to_string()));

        let snap = state.snapshot(0);
        assert_eq!(snap.status, ConnStatus::External);
        assert_eq!(snap.pid, 10);

        assert!(state.clear_external());
        assert!(!state.clear_external());
        assert_eq!(state.status(), ConnStatus::Disconnected);
    }

    #[test]
    fn test_take_external() {
        let mut state = state_with_connection(false);
        assert_eq!(state.take_external(), None);
        state.set_external(9, "vpn.example.com".to_string());

        let ext = state.take_external().unwrap();
        assert_eq!(ext.pid, 9);
        assert_eq!(state.status(), ConnStatus::Disconnected);
        assert_eq!(state.external(), None);
    }

    #[test]
    fn test_tunnel_device_needs_snapshot() {
        let mut state = state_with_connection(false);
        assert!(!state.record_tunnel_device("tun3"));
        state.set_network_snapshot(NetworkSnapshot::default());
        assert!(state.record_tunnel_device("tun3"));
        assert_eq!(state.network_snapshot().unwrap().tunnel_interface, "tun3");
    }
}
