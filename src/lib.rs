//! lazyconnect - background session daemon for an OpenConnect VPN
//!
//! The daemon owns the VPN subprocess (on a pseudo-terminal), tracks the
//! connection state, reconnects after drops and sleep, and serves a single
//! interactive client over a Unix socket.

pub mod config;
pub mod daemon;
pub mod ipc;
pub mod logstore;
pub mod paths;
pub mod platform;
pub mod state;
pub mod vpn;

pub use config::{Config, DaemonOptions};
pub use daemon::{Daemon, DaemonError};
pub use paths::DaemonPaths;
