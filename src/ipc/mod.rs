//! IPC between the daemon and its client
//!
//! A Unix socket (`<config dir>/daemon.sock`, mode 0600) carrying
//! newline-delimited JSON. Every message is an object with a `type` field;
//! see [`protocol`] for the command and event sets.
//!
//! # Usage
//!
//! ## Daemon side (server)
//!
//! ```ignore
//! let listener = ipc::server::bind(&paths.socket)?;
//! let server = IpcServer::new(paths.socket.clone(), handler, clients, shutdown_rx);
//! server.run(listener).await;
//! ```
//!
//! ## Client side
//!
//! ```ignore
//! let mut client = DaemonClient::connect(&paths.socket).await?;
//! if client.hello(env!("CARGO_PKG_VERSION")).await? {
//!     client.send(&Command::GetState).await?;
//! }
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use protocol::{Command, ErrorCode, Event, ReconnectReason, StateSnapshot};
pub use server::{cleanup_ipc, ClientSlot, CommandHandler, IpcServer};
