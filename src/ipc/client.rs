//! IPC client for talking to the daemon
//!
//! Holds one long-lived connection: commands go out with [`DaemonClient::send`]
//! and events (replies and unsolicited pushes alike) come back through
//! [`DaemonClient::recv`].

use super::protocol::{read_message, write_message, Command, Event};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Timeout for connect and write operations
pub const IPC_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connect to the daemon socket. Connecting takes over the daemon's
    /// single client slot.
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let stream = match timeout(IPC_TIMEOUT, UnixStream::connect(path)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!("Failed to connect to IPC: {}", e);
                return Err(e);
            }
            Err(_) => {
                debug!("IPC connect timeout");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Connect timeout"));
            }
        };

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send(&mut self, cmd: &Command) -> io::Result<()> {
        debug!("Sending IPC command: {:?}", cmd);
        match timeout(IPC_TIMEOUT, write_message(&mut self.writer, cmd)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Write timeout")),
        }
    }

    /// Send a pre-encoded line (used to exercise the daemon's tolerance of
    /// messages it does not understand)
    pub async fn send_raw(&mut self, json: &str) -> io::Result<()> {
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Next event, waiting as long as it takes
    pub async fn recv(&mut self) -> io::Result<Event> {
        read_message(&mut self.reader).await
    }

    pub async fn recv_timeout(&mut self, within: Duration) -> io::Result<Event> {
        match timeout(within, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Read timeout")),
        }
    }

    /// Read events until one matches `pred`, discarding the rest
    pub async fn wait_for<F>(&mut self, within: Duration, mut pred: F) -> io::Result<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.recv_timeout(remaining).await?;
            if pred(&event) {
                return Ok(event);
            }
            debug!("Skipping {} while waiting", event.kind());
        }
    }

    /// Version handshake. Returns whether the daemon considers us compatible.
    pub async fn hello(&mut self, version: &str) -> io::Result<bool> {
        self.send(&Command::Hello {
            version: version.to_string(),
        })
        .await?;

        match self
            .wait_for(IPC_TIMEOUT, |e| {
                matches!(e, Event::HelloResponse { .. } | Event::Kicked)
            })
            .await?
        {
            Event::HelloResponse { compatible, .. } => Ok(compatible),
            _ => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "Kicked by another client",
            )),
        }
    }
}
