//! IPC protocol between the client and the daemon
//!
//! Newline-delimited JSON framing: each message is one JSON object followed by
//! `\n`, discriminated by its `type` field. Messages are capped at 1MB.

use crate::config::Config;
use crate::state::ConnStatus;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Commands from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Hello {
        #[serde(default)]
        version: String,
    },
    GetState,
    GetLogs {
        #[serde(default)]
        from: u64,
        #[serde(default)]
        to: u64,
    },
    ClearLogs,
    Connect {
        conn_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Disconnect,
    Input {
        #[serde(default)]
        value: String,
    },
    ConfigUpdate {
        #[serde(default)]
        config: Config,
    },
    Cleanup,
    Shutdown,
    /// Any message type this daemon does not know; ignored
    #[serde(other)]
    Unknown,
}

/// Error codes surfaced to the client in `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyConnected,
    InvalidConn,
    CleanupRunning,
    ClearLogsFailed,
    StartFailed,
    PtyFailed,
    NotRunning,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyConnected => "already_connected",
            ErrorCode::InvalidConn => "invalid_conn",
            ErrorCode::CleanupRunning => "cleanup_running",
            ErrorCode::ClearLogsFailed => "clear_logs_failed",
            ErrorCode::StartFailed => "start_failed",
            ErrorCode::PtyFailed => "pty_failed",
            ErrorCode::NotRunning => "not_running",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reconnect session was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    /// The VPN process died on its own
    Exit,
    /// The host resumed from sleep
    Wake,
}

/// Snapshot sent in reply to `get_state` and on state broadcasts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub status: ConnStatus,
    pub active_conn_id: String,
    pub ip: String,
    pub pid: u32,
    pub total_log_lines: u64,
}

/// Events from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    HelloResponse {
        version: String,
        compatible: bool,
    },
    State(StateSnapshot),
    Log {
        line: String,
        line_number: u64,
    },
    LogRange {
        from: u64,
        lines: Vec<String>,
        total_lines: u64,
    },
    Prompt {
        is_password: bool,
    },
    Connected {
        ip: String,
        pid: u32,
    },
    Disconnected,
    Error {
        code: ErrorCode,
        message: String,
    },
    Kicked,
    Reconnecting {
        conn_id: String,
        reason: ReconnectReason,
        attempt: u32,
        max: u32,
    },
    CleanupStep {
        line: String,
    },
    CleanupDone,
}

impl Event {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Event::Error {
            code,
            message: message.into(),
        }
    }

    /// The wire `type` tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::HelloResponse { .. } => "hello_response",
            Event::State(_) => "state",
            Event::Log { .. } => "log",
            Event::LogRange { .. } => "log_range",
            Event::Prompt { .. } => "prompt",
            Event::Connected { .. } => "connected",
            Event::Disconnected => "disconnected",
            Event::Error { .. } => "error",
            Event::Kicked => "kicked",
            Event::Reconnecting { .. } => "reconnecting",
            Event::CleanupStep { .. } => "cleanup_step",
            Event::CleanupDone => "cleanup_done",
        }
    }
}

/// Read one newline-terminated JSON message
///
/// Returns `UnexpectedEof` when the peer has closed the connection.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }

    if buf.last() != Some(&b'\n') {
        if n > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: more than {} bytes", MAX_MESSAGE_SIZE),
            ));
        }
        // Peer closed mid-message
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-message",
        ));
    }

    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON parse error: {}", e),
        )
    })
}

/// Write one message followed by a newline
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(message).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON serialize error: {}", e),
        )
    })?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message too large: {} bytes (max {})",
                json.len(),
                MAX_MESSAGE_SIZE
            ),
        ));
    }

    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_command_wire_names() {
        let cmd: Command = serde_json::from_str(r#"{"type":"get_state"}"#).unwrap();
        assert_eq!(cmd, Command::GetState);

        let cmd: Command =
            serde_json::from_str(r#"{"type":"connect","conn_id":"c1","password":"pw"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Connect {
                conn_id: "c1".to_string(),
                password: Some("pw".to_string()),
            }
        );

        let cmd: Command = serde_json::from_str(r#"{"type":"get_logs","from":0,"to":10}"#).unwrap();
        assert_eq!(cmd, Command::GetLogs { from: 0, to: 10 });
    }

    #[test]
    fn test_connect_without_password_omits_field() {
        let json = serde_json::to_string(&Command::Connect {
            conn_id: "c1".to_string(),
            password: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"connect","conn_id":"c1"}"#);
    }

    #[test]
    fn test_unknown_command_type_is_tolerated() {
        let cmd: Command = serde_json::from_str(r#"{"type":"frobnicate","x":1}"#).unwrap();
        assert_eq!(cmd, Command::Unknown);
    }

    #[test]
    fn test_config_update_carries_camel_case_config() {
        let json = r#"{"type":"config_update","config":{"connections":[
            {"id":"c1","name":"Work","protocol":"gp","host":"vpn.example.com","hasPassword":true}
        ],"settings":{"reconnect":true}}}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::ConfigUpdate { config } => {
                assert_eq!(config.connections.len(), 1);
                assert!(config.connections[0].has_password);
                assert!(config.settings.reconnect);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_update_tolerates_sparse_profiles() {
        let json = r#"{"type":"config_update","config":{"connections":[
            {"id":"c1","protocol":"gp","host":"vpn.example.com"},
            {"id":"c2","name":"Lab","protocol":"ssl","host":"lab.example.com"}
        ]}}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        let Command::ConfigUpdate { config } = cmd else {
            panic!("expected config_update");
        };
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.connections[0].name, "");
        assert_eq!(config.connections[1].protocol.as_str(), "ssl");
    }

    #[test]
    fn test_event_wire_shapes() {
        let json = serde_json::to_string(&Event::State(StateSnapshot {
            status: ConnStatus::Connected,
            active_conn_id: "c1".to_string(),
            ip: "10.0.0.5".to_string(),
            pid: 42,
            total_log_lines: 7,
        }))
        .unwrap();
        assert!(json.starts_with(r#"{"type":"state","status":3,"#));
        assert!(json.contains(r#""total_log_lines":7"#));

        let json = serde_json::to_string(&Event::error(ErrorCode::InvalidConn, "nope")).unwrap();
        assert_eq!(json, r#"{"type":"error","code":"invalid_conn","message":"nope"}"#);

        let json = serde_json::to_string(&Event::Reconnecting {
            conn_id: "c1".to_string(),
            reason: ReconnectReason::Wake,
            attempt: 1,
            max: 3,
        })
        .unwrap();
        assert!(json.contains(r#""reason":"wake""#));

        assert_eq!(serde_json::to_string(&Event::Kicked).unwrap(), r#"{"type":"kicked"}"#);
    }

    #[tokio::test]
    async fn test_read_write_over_stream() {
        let (mut client_w, server) = tokio::io::duplex(4096);
        let mut server_r = BufReader::new(server);

        write_message(&mut client_w, &Command::Hello { version: "1.0".to_string() })
            .await
            .unwrap();
        write_message(&mut client_w, &Command::Disconnect).await.unwrap();

        let first: Command = read_message(&mut server_r).await.unwrap();
        let second: Command = read_message(&mut server_r).await.unwrap();
        assert_eq!(first, Command::Hello { version: "1.0".to_string() });
        assert_eq!(second, Command::Disconnect);
    }

    #[tokio::test]
    async fn test_read_malformed_json_is_invalid_data() {
        let mut reader = BufReader::new(&b"{not json}\n"[..]);
        let err = read_message::<_, Command>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_eof() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_message::<_, Command>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_oversized_message() {
        let mut data = vec![b'a'; MAX_MESSAGE_SIZE + 10];
        data.push(b'\n');
        let mut reader = BufReader::new(&data[..]);
        let err = read_message::<_, Command>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
