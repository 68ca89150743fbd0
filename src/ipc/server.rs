//! IPC server for daemon-side communication
//!
//! Listens on a Unix socket and serves at most one client at a time: a new
//! connection evicts the previous one, which is sent `kicked` and closed.
//! All outbound events go through [`ClientSlot`], whose lock serializes
//! writes so that events reach the client in the order they were produced.

use super::protocol::{read_message, write_message, Command, Event};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Give up on a client that stops reading
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives decoded commands from the active client
pub trait CommandHandler: Send + Sync + 'static {
    /// Must return promptly; long-running work belongs in a spawned task so
    /// the client can keep sending (e.g. `disconnect` during `connect`).
    fn handle(self: Arc<Self>, cmd: Command) -> impl Future<Output = ()> + Send;
}

struct ActiveClient {
    id: u64,
    writer: OwnedWriteHalf,
    // Dropping or firing this ends the connection's read loop
    _evict: oneshot::Sender<()>,
}

/// The single active client connection
pub struct ClientSlot {
    current: Mutex<Option<ActiveClient>>,
    next_id: AtomicU64,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make `writer` the active client, kicking whoever held the slot
    async fn install(&self, writer: OwnedWriteHalf, evict: oneshot::Sender<()>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut current = self.current.lock().await;

        if let Some(mut old) = current.take() {
            info!("Kicking previous client {}", old.id);
            if let Err(e) = timed_write(&mut old.writer, &Event::Kicked).await {
                debug!("Could not notify kicked client: {}", e);
            }
            let _ = old.writer.shutdown().await;
        }

        *current = Some(ActiveClient {
            id,
            writer,
            _evict: evict,
        });
        id
    }

    /// Send an event to the active client, if any. A client that cannot be
    /// written to is dropped.
    pub async fn send(&self, event: &Event) {
        let mut current = self.current.lock().await;
        let Some(client) = current.as_mut() else {
            return;
        };

        if let Err(e) = timed_write(&mut client.writer, event).await {
            warn!("Failed to send {} to client {}: {}", event.kind(), client.id, e);
            *current = None;
        }
    }

    pub async fn is_current(&self, id: u64) -> bool {
        self.current.lock().await.as_ref().map(|c| c.id) == Some(id)
    }

    /// Clear the slot if `id` still holds it
    async fn release(&self, id: u64) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|c| c.id) == Some(id)
            && let Some(mut client) = current.take()
        {
            let _ = client.writer.shutdown().await;
        }
    }

    /// Drop the active client (daemon shutdown)
    pub async fn close(&self) {
        if let Some(mut client) = self.current.lock().await.take() {
            let _ = client.writer.shutdown().await;
        }
    }
}

impl Default for ClientSlot {
    fn default() -> Self {
        Self::new()
    }
}

async fn timed_write(writer: &mut OwnedWriteHalf, event: &Event) -> io::Result<()> {
    match timeout(WRITE_TIMEOUT, write_message(writer, event)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Write timeout")),
    }
}

/// Bind the daemon socket, replacing any stale socket file. Owner-only
/// permissions.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(path)?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Remove the socket file (call on daemon exit)
pub fn cleanup_ipc(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to remove socket {:?}: {}", path, e);
    }
}

/// Accept loop feeding the active client's commands to a handler
pub struct IpcServer<H> {
    path: PathBuf,
    handler: Arc<H>,
    clients: Arc<ClientSlot>,
    shutdown: watch::Receiver<bool>,
}

impl<H: CommandHandler> IpcServer<H> {
    pub fn new(
        path: PathBuf,
        handler: Arc<H>,
        clients: Arc<ClientSlot>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            path,
            handler,
            clients,
            shutdown,
        }
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(mut self, listener: UnixListener) {
        info!("IPC server listening on {:?}", self.path);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = self.handler.clone();
                        let clients = self.clients.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, handler, clients).await;
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept IPC connection: {}", e);
                    }
                },
                _ = self.shutdown.wait_for(|stop| *stop) => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection<H: CommandHandler>(
    stream: UnixStream,
    handler: Arc<H>,
    clients: Arc<ClientSlot>,
) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (evict_tx, mut evict_rx) = oneshot::channel();
    let id = clients.install(writer, evict_tx).await;
    info!("Client {} connected", id);

    let mut greeted = false;
    loop {
        let message = tokio::select! {
            _ = &mut evict_rx => {
                debug!("Client {} superseded, exiting read loop", id);
                return;
            }
            message = read_message::<_, Command>(&mut reader) => message,
        };

        let cmd = match message {
            Ok(cmd) => cmd,
            Err(e) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    info!("Client {} disconnected", id);
                } else {
                    warn!("Dropping client {}: {}", id, e);
                }
                clients.release(id).await;
                return;
            }
        };

        if !clients.is_current(id).await {
            debug!("Client {} superseded, ignoring its command", id);
            return;
        }

        match &cmd {
            Command::Hello { .. } => greeted = true,
            Command::Unknown => {
                debug!("Ignoring unknown message type from client {}", id);
                continue;
            }
            _ if !greeted => debug!("Client {} sent a command before hello", id),
            _ => {}
        }

        handler.clone().handle(cmd).await;
    }
}
